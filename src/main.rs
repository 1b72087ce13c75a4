#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    sqlgate_lib::app::run().await
}

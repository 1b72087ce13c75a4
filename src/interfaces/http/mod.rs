use crate::application::{QueryPipeline, QueryRequest};
use crate::domain::error::{AppError, ExecutionErrorKind};
use crate::infrastructure::config::ServerConfig;
use actix_web::http::StatusCode;
use actix_web::{dev::Server, get, post, web, App, HttpResponse, HttpServer, Responder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct HttpState {
    pub pipeline: Arc<QueryPipeline>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

pub fn error_status(err: &AppError) -> StatusCode {
    match err {
        AppError::Validation { .. } => StatusCode::BAD_REQUEST,
        AppError::NoMatchingQuery(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::ClarificationExhausted(_) => StatusCode::CONFLICT,
        AppError::UnsafeStatement(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::Execution {
            kind: ExecutionErrorKind::Connection,
            ..
        } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::Execution {
            kind: ExecutionErrorKind::Timeout,
            ..
        } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &AppError) -> HttpResponse {
    let status = error_status(err);
    if status.is_server_error() {
        error!("Query failed: {}", err);
    } else {
        warn!("Query refused: {}", err);
    }
    HttpResponse::build(status).json(ErrorBody {
        error: err.kind_tag(),
        message: err.user_message(),
    })
}

#[post("/query")]
async fn query(data: web::Data<HttpState>, req: web::Json<QueryRequest>) -> impl Responder {
    let request = req.into_inner();
    info!(
        "Query received{}",
        request
            .session_id
            .map(|id| format!(" for session {}", id))
            .unwrap_or_default()
    );
    match data.pipeline.handle(request).await {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(e) => error_response(&e),
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(HealthBody { status: "ok" })
}

pub fn start_server(pipeline: Arc<QueryPipeline>, config: &ServerConfig) -> std::io::Result<Server> {
    let state = web::Data::new(HttpState { pipeline });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(web::scope("/api").service(query).service(health))
    })
    .bind((config.host.as_str(), config.port))?
    .run();

    info!("HTTP server listening on {}:{}", config.host, config.port);
    Ok(server)
}

//! JSON admin API over the gateway.
//!
//! Write actions go through the [`Gateway`], so adding or removing a
//! service starts or stops it immediately, not just on the next reload.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{CommandConfig, ServiceConfig};
use crate::gateway::Gateway;

type AdminResult = std::result::Result<Json<Value>, AdminError>;

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/api/services", get(list_services).post(add_service))
        .route("/api/services/{name}", delete(remove_service))
        .route("/api/services/{name}/toggle", post(toggle_service))
        .route("/api/services/{name}/refresh", post(refresh_service))
        .route("/api/tools", get(list_tools))
        .route("/api/commands", get(list_commands).post(add_command))
        .route("/api/commands/{name}", delete(remove_command))
        .with_state(gateway)
}

/// Bind `listen` and serve the admin API in the background.
pub async fn start_admin_server(
    listen: &str,
    gateway: Gateway,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind admin API on {listen}"))?;
    let addr = listener.local_addr()?;
    info!(%addr, "admin API listening");

    let app = router(gateway);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("admin API error: {}", e);
        }
    });

    Ok((addr, handle))
}

async fn list_services(State(gateway): State<Gateway>) -> Json<Value> {
    let services = gateway.services();
    Json(json!({"total": services.len(), "services": services}))
}

async fn add_service(
    State(gateway): State<Gateway>,
    Json(service): Json<ServiceConfig>,
) -> AdminResult {
    let name = service.name.clone();
    gateway.add_service(service).await?;
    Ok(Json(json!({"message": "service added", "name": name})))
}

async fn remove_service(State(gateway): State<Gateway>, Path(name): Path<String>) -> AdminResult {
    if !gateway.remove_service(&name).await? {
        return Err(AdminError::not_found(format!("no service named '{name}'")));
    }
    Ok(Json(json!({"message": "service removed", "name": name})))
}

async fn toggle_service(State(gateway): State<Gateway>, Path(name): Path<String>) -> AdminResult {
    match gateway.toggle_service(&name).await? {
        Some(enabled) => Ok(Json(json!({"name": name, "enabled": enabled}))),
        None => Err(AdminError::not_found(format!("no service named '{name}'"))),
    }
}

async fn refresh_service(State(gateway): State<Gateway>, Path(name): Path<String>) -> AdminResult {
    let tool_count = gateway.refresh_service(&name).await?;
    Ok(Json(json!({"name": name, "tool_count": tool_count})))
}

async fn list_tools(State(gateway): State<Gateway>) -> Json<Value> {
    let tools = gateway.tools().await;
    Json(json!({"total": tools.len(), "tools": tools}))
}

async fn list_commands(State(gateway): State<Gateway>) -> Json<Value> {
    let config = gateway.config();
    Json(json!({"commands": config.commands}))
}

async fn add_command(
    State(gateway): State<Gateway>,
    Json(command): Json<CommandConfig>,
) -> AdminResult {
    let name = command.name.clone();
    gateway.add_command(command).await?;
    Ok(Json(json!({"message": "command saved", "name": name})))
}

async fn remove_command(State(gateway): State<Gateway>, Path(name): Path<String>) -> AdminResult {
    if !gateway.remove_command(&name).await? {
        return Err(AdminError::not_found(format!("no command named '{name}'")));
    }
    Ok(Json(json!({"message": "command removed", "name": name})))
}

/// Error representation for HTTP responses.
#[derive(Debug)]
struct AdminError {
    status: StatusCode,
    message: String,
}

impl AdminError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<crate::Error> for AdminError {
    fn from(e: crate::Error) -> Self {
        let status = match &e {
            crate::Error::Config(_) => StatusCode::BAD_REQUEST,
            crate::Error::ServiceNotConnected(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

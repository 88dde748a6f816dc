//! An HTTP server example demonstrating the embedhttp server API.
//!
//! Run with `RUST_LOG=info cargo run --example http_server`.

use std::time::Duration;

use embedhttp::{HttpContext, HttpServer, ServerConfig, ServerError, StatusCode, Verb};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct User {
    name: String,
    email: String,
}

async fn not_found(mut ctx: HttpContext) -> Result<(), ServerError> {
    let message = format!(
        "No endpoint for {} {}",
        ctx.request.verb, ctx.request.raw_url_without_query
    );
    ctx.response
        .send_error(StatusCode::NOT_FOUND, &message, 404, "")
        .await
}

async fn index(mut ctx: HttpContext) -> Result<(), ServerError> {
    ctx.response
        .send_string(
            "<html><body><h1>Welcome to embedhttp!</h1></body></html>",
            "text/html",
        )
        .await;
    Ok(())
}

async fn hello(mut ctx: HttpContext) -> Result<(), ServerError> {
    let name = ctx.request.get_query_param("name").unwrap_or("World").to_string();
    ctx.response
        .send_string(&format!("Hello, {name}!"), "text/plain")
        .await;
    Ok(())
}

async fn get_user(mut ctx: HttpContext) -> Result<(), ServerError> {
    let user = User {
        name: "John Doe".to_string(),
        email: "john@example.com".to_string(),
    };
    ctx.response.send_json(&user).await
}

async fn create_user(mut ctx: HttpContext) -> Result<(), ServerError> {
    if !ctx.request.is_json() {
        return ctx
            .response
            .send_error(StatusCode::BAD_REQUEST, "Expected a JSON body", 1, "")
            .await;
    }

    let user: User = ctx.request.post_data().await?;
    info!("Created user {}", user.name);
    ctx.response.status_code = StatusCode::CREATED;
    ctx.response.send_json(&user).await
}

async fn headers(mut ctx: HttpContext) -> Result<(), ServerError> {
    let mut body = String::from("Request Headers:\n\n");
    for (name, value) in &ctx.request.headers {
        body.push_str(&format!("{name}: {value}\n"));
    }

    ctx.response
        .headers
        .insert("X-Custom-Header".to_string(), "Custom Value".to_string());
    ctx.response.send_string(&body, "text/plain").await;
    Ok(())
}

async fn countdown(mut ctx: HttpContext) -> Result<(), ServerError> {
    for i in (1..=5).rev() {
        if ctx.is_cancelled() {
            break;
        }
        ctx.response.send_chunk(format!("{i}...\n").as_bytes()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    ctx.response.send_final_chunk(Some(b"liftoff\n")).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::new("127.0.0.1", 8080).with_timeout(Duration::from_secs(30));
    let server = HttpServer::start(config, not_found).await?;

    server.add_endpoint(Verb::GET, "/", index)?;
    server.add_endpoint(Verb::GET, "/hello", hello)?;
    server.add_endpoint(Verb::GET, "/api/user", get_user)?;
    server.add_endpoint(Verb::POST, "/api/user", create_user)?;
    server.add_endpoint(Verb::GET, "/headers", headers)?;
    server.add_endpoint(Verb::GET, "/countdown", countdown)?;

    info!("Server configured with the following endpoints:");
    for endpoint in server.endpoints() {
        info!("  {endpoint}");
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    server.shutdown().await;

    Ok(())
}

//! Demo GOSOC server: a single chat controller over the default
//! accept-all user.

mod cli;

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use gosoc::{
    ActionContext,
    ActionError,
    ActionResult,
    App,
    AppConfig,
    Controller,
    ResponseBody,
    decode_params,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
struct AddMessageParams {
    message: String,
}

struct ChatController;

#[async_trait]
impl Controller for ChatController {
    async fn dispatch(&self, action: &str, ctx: ActionContext<'_>) -> ActionResult {
        match action {
            "AddMessage" => {
                let params: AddMessageParams = decode_params(ctx.payload)?;
                println!("user {} message received: {}", ctx.user.uid(), params.message);
                Ok(ResponseBody::success(json!({ "message_id": "1" })))
            }
            other => Err(ActionError::user(format!("action {other} not found"))),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), gosoc::AppError> {
    env_logger::init();

    let cli = cli::Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::new(cli.addr.clone(), cli.port),
    };

    App::new(config)
        .route("chat", Arc::new(ChatController))
        .run()
        .await
}

mod cli;
mod infra;
mod ops;
mod routes;
mod server;

use fiscal_pipeline::error::AppError;

pub async fn run() -> Result<(), AppError> {
    cli::run().await
}

use fiscal_pipeline_worker::run;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("fiscal worker error: {err}");
        std::process::exit(1);
    }
}

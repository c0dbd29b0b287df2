use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let exit_code = bb7_daemon::run_main().await?;
    std::process::exit(exit_code);
}

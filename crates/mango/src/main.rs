use anyhow::Result;
use clap::Parser;
use mango_core::errors::MangoError;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(mango_error) = err.downcast_ref::<MangoError>() {
                let code = mango_error.exit_code();
                if code != mango_core::errors::EXIT_FAILURE {
                    eprintln!("Error: {:#}", err);
                    std::process::exit(code);
                }
            }
            Err(err)
        }
    }
}

use std::process::ExitCode;

use clap::Parser;

use pkgward::env::{EnvOptions, Environment};
use pkgward::nursery::default_concurrency;
use pkgward::report::Reporter;

use crate::args::Args;
use crate::replacer::RollingReplacer;

mod args;
mod replacer;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    pkgward::tracing::init(args.verbose);
    tracing::debug!("{args:?}");

    let reporter = Reporter::decorated(args.verbose);

    let env = Environment::new(
        EnvOptions {
            concurrency: default_concurrency(),
            ..EnvOptions::default()
        },
        reporter.clone(),
    );

    let outcome = async {
        let replacer = RollingReplacer::new(args, env, reporter.clone()).await?;
        replacer.run().await
    }
    .await;

    match outcome {
        Ok(()) => ExitCode::from(reporter.exit_code() as u8),
        Err(error) => {
            reporter.error(format_args!("{error:#}"));
            ExitCode::FAILURE
        }
    }
}

//! Trace a command line and print the resulting process tree.
//!
//!     cargo run --example trace -- bash -c 'ls / | wc -l'

use std::env;

use treetrace::Tracer;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let program = match argv.first() {
        Some(program) => program.clone(),
        None => {
            eprintln!("usage: trace PROGRAM [ARGS...]");
            std::process::exit(2);
        }
    };

    let tracer = Tracer::new();
    let root = tracer.start(&program, argv)?;

    while tracer.step()? {}

    print!("{root}");

    Ok(())
}

//! PDDL language server over stdio.
//!
//! Logs go to stderr; set `RUST_LOG=pddl_lsp=debug` for more detail.

use pddl_lsp::Backend;
use tower_lsp::{LspService, Server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pddl_lsp=info".parse().expect("valid log directive"))
                .add_directive("tower_lsp=info".parse().expect("valid log directive")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting pddl-lsp {}", pddl_lsp::VERSION);

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::new(Backend::new);
    Server::new(stdin, stdout, socket).serve(service).await;
}

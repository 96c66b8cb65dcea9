//! `vecai` binary entry point. Argument parsing and runtime wiring live in
//! [`vecai_core::cli`]; this file only bridges process argv/exit-code.

#[tokio::main]
async fn main() {
    let code = vecai_core::cli::run(std::env::args()).await;
    std::process::exit(code);
}

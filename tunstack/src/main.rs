use tunstack::cli::initialize_from_arguments;

#[tokio::main]
async fn main() {
    println!("tunstack v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = initialize_from_arguments().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

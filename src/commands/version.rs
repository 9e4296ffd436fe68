pub fn run() {
    println!("codeb-control {}", env!("CARGO_PKG_VERSION"));
}

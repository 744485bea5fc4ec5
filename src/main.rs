fn main() {
    if let Err(err) = sheet_stage::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

use thinkpad_lib::commandline;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = commandline::parse(&args);
    std::process::exit(commandline::run_with_args(&args));
}

mod cli;
mod report;
mod runner;

use clap::Parser;

use cli::CliArgs;

fn main() {
    let args = CliArgs::parse();
    if args.ranks < 1 {
        eprintln!("ERROR: at least one rank is required");
        std::process::exit(2);
    }
    if args.stride < 1 {
        eprintln!("ERROR: stride must be at least 1");
        std::process::exit(2);
    }

    let report = runner::run(&args);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
    } else {
        report.print_text();
    }
    if report.verify_errors > 0 {
        std::process::exit(1);
    }
}

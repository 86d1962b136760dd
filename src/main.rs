use kestrel_scripting::cli::CliOverrides;
use kestrel_scripting::run_with_overrides;

fn main() {
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    match run_with_overrides(&cli).and_then(|output| Ok(serde_json::to_string_pretty(&output)?)) {
        Ok(report) => println!("{report}"),
        Err(err) => {
            eprintln!("Harness error: {err:?}");
            std::process::exit(1);
        }
    }
}

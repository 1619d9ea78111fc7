use colored::Colorize;

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "error:".bright_red(), e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    vigil::run()?;
    Ok(())
}

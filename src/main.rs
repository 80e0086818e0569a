/// Opal CLI driver
///
/// `opal module[.Class[.method]] [args…]` loads the entry module and
/// dispatches the entry class method; a missing class defaults to `Start`
/// and a missing method to `start`.  The process exit code is the entry
/// method's integer result, or the dedicated error code.

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "opal",
    version,
    about = "The Opal virtual machine",
    long_about = "opal — run a compiled Opal module: opal module[.Class[.method]] [args...]"
)]
struct Cli {
    /// Entry point: module, module.Class, or module.Class.method
    entry: String,

    /// Arguments passed to the entry method as strings
    args: Vec<String>,

    /// Value stack size in cells (0 selects the default)
    #[arg(long, default_value_t = 0)]
    stack_size: usize,

    /// Frame stack size in bytes (0 selects the default)
    #[arg(long, default_value_t = 0)]
    frame_stack_size: usize,

    /// Trace byte-code execution to stderr
    #[arg(long)]
    trace: bool,
}

/// Split `module[.Class[.method]]` with the documented defaults.
fn parse_entry(entry: &str) -> (String, String, String) {
    let mut it = entry.splitn(2, '.');
    let module = it.next().unwrap_or_default().to_string();
    match it.next() {
        None => (module, "Start".into(), "start".into()),
        Some(rest) => match rest.rsplit_once('.') {
            None => (module, rest.to_string(), "start".into()),
            Some((class, method)) => (module, class.to_string(), method.to_string()),
        },
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let (module, class, method) = parse_entry(&cli.entry);

    let mut th = opal::Vm::init(cli.stack_size, cli.frame_stack_size);
    th.trace = cli.trace;

    let dst = match th.alloc(1) {
        Ok(d) => d,
        Err(u) => anyhow::bail!("initialization failed: {:?}", u),
    };
    match opal::run(&mut th, dst, &module, &class, &method, &cli.args) {
        Ok(()) => std::process::exit(opal::exit_code_of(&mut th, dst)),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_entry;

    #[test]
    fn entry_defaults() {
        assert_eq!(
            parse_entry("hello"),
            ("hello".into(), "Start".into(), "start".into())
        );
        assert_eq!(
            parse_entry("hello.Main"),
            ("hello".into(), "Main".into(), "start".into())
        );
        assert_eq!(
            parse_entry("hello.a.Main.go"),
            ("hello".into(), "a.Main".into(), "go".into())
        );
    }
}

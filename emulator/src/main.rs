mod session;
mod sim;

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use pocket_core::TickRate;
use session::Session;

const DEFAULT_RATE_HZ: u32 = 1_000;

fn main() -> io::Result<()> {
    let rate_hz = parse_rate().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: pocket-sim [--rate <hz>]");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(TickRate::from_hz(rate_hz));
    let mut line = String::new();

    writeln!(
        writer,
        "Pocket simulator ready at {rate_hz} Hz. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for response in session.handle_command(trimmed) {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_rate() -> Result<u32, String> {
    let mut args = env::args().skip(1);
    let Some(arg) = args.next() else {
        return Ok(DEFAULT_RATE_HZ);
    };

    let value = if let Some(value) = arg.strip_prefix("--rate=") {
        value.to_string()
    } else if arg == "--rate" {
        args.next()
            .ok_or_else(|| "Expected value after --rate".to_string())?
    } else {
        return Err(format!("Unknown argument `{arg}`"));
    };

    match value.parse::<u32>() {
        Ok(hz) if hz > 0 => Ok(hz),
        _ => Err(format!("Invalid tick rate `{value}`")),
    }
}

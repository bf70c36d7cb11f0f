//! Stdin command source. Each non-empty line becomes a user event.

use std::io::{self, BufRead};
use std::thread;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::controller::Event;
use crate::parser::{Command, CommandParser};

/// Read stdin on a dedicated thread; the event loop never blocks on input.
pub fn spawn(parser: CommandParser, tx: mpsc::UnboundedSender<Event>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("console".into())
        .spawn(move || read_commands(io::stdin().lock(), &parser, &tx))
}

pub fn read_commands<R: BufRead>(reader: R, parser: &CommandParser, tx: &mpsc::UnboundedSender<Event>) {
    info!("console ready: tk <ticker> | buy <put|call> [itm|otm] [mo|lo] [min|max|mmax|n] | sell <put|call> [mo|lo] | cancel <id> | preview <put|call> | calc <put|call> <spot> <days> <strike> <iv> <rate> | refresh | quit");
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("stdin read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let ev = match parser.parse(&line) {
            Ok(cmd) => Event::User(cmd),
            Err(e) => Event::Invalid(e),
        };
        if tx.send(ev).is_err() {
            return;
        }
    }
    // End of input ends the session.
    let _ = tx.send(Event::User(Command::Quit));
}

//! Line-oriented stanza feed.
//!
//! Each input line is either a command or one complete stanza:
//!
//! ```text
//! :routes            print the route table
//! :components        print the loaded components
//! :close <jid>       signal that a client stream closed
//! :quit              stop the proxy
//! <message .../>     route a stanza
//! ```

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};
use xop_router::{Stanza, XopContext};

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Routes,
    Components,
    Close(String),
    Quit,
    Stanza(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Command::Empty);
        }
        let Some(command) = line.strip_prefix(':') else {
            return Ok(Command::Stanza(line.to_string()));
        };

        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("routes"), None, _) => Ok(Command::Routes),
            (Some("components"), None, _) => Ok(Command::Components),
            (Some("close"), Some(jid), None) => Ok(Command::Close(jid.to_string())),
            (Some("quit"), None, _) => Ok(Command::Quit),
            _ => Err(format!("unknown command: {line}")),
        }
    }
}

/// Read lines until `:quit` or end of input.
pub async fn run<R>(ctx: &XopContext, input: R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Ok(Command::Empty) => {}
            Ok(Command::Routes) => println!("{}", ctx.routes()),
            Ok(Command::Components) => println!("{}", ctx.components()),
            Ok(Command::Close(jid)) => ctx.handle_close_stream(&jid).await,
            Ok(Command::Quit) => {
                info!("Quit requested");
                return Ok(());
            }
            Ok(Command::Stanza(xml)) => match xml.parse::<Stanza>() {
                Ok(stanza) => {
                    let result = ctx.process_packet(stanza);
                    debug!(?result, "Stanza submitted");
                }
                Err(e) => warn!(error = %e, "Ignoring unparseable stanza"),
            },
            Err(e) => warn!("{e}"),
        }
    }

    info!("Input closed");
    Ok(())
}

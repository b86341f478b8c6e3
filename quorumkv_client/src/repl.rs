//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use color_print::{cprint, cprintln};

use tokio::time::Instant;

use quorumkv::{QuorumKvError, QuorumTable};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable command types.
#[derive(Debug, PartialEq)]
enum ReplCommand {
    Put { key: String, data: String },
    Get { key: String },
    Del { key: String },
    Size,
    GetKeys,
    GetTs { key: String },

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub struct ClientRepl {
    /// Replicated table handle; `None` once disconnected.
    table: Option<QuorumTable>,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client.
    pub fn new(table: QuorumTable) -> Self {
        ClientRepl {
            table: Some(table),
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() -> Result<(), QuorumKvError> {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&QuorumKvError>) {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          put <key> <data>");
        println!("          get <key>");
        println!("          del <key>");
        println!("          size");
        println!("          getkeys");
        println!("          getts <key>");
        println!("          help");
        println!("          quit");
        println!(
            "      Keys and data currently cannot contain any whitespaces"
        );
    }

    /// Expect to get the next segment string from parsed segs.
    #[inline]
    fn expect_next_seg<'s>(
        segs: &mut SplitWhitespace<'s>,
    ) -> Result<&'s str, QuorumKvError> {
        segs.next()
            .ok_or_else(|| QuorumKvError::msg("not enough args"))
    }

    /// Parses one input line into a command.
    fn parse_command(line: &str) -> Result<ReplCommand, QuorumKvError> {
        // split input line by whitespaces, getting an iterator of segments
        let mut segs = line.split_whitespace();

        // get command type, match case-insensitively
        let cmd_type = match segs.next() {
            Some(cmd_type) => cmd_type,
            None => return Ok(ReplCommand::Nothing),
        };

        // keys and data are kept as-is, no case conversions
        match &cmd_type.to_lowercase()[..] {
            "put" => {
                let key = Self::expect_next_seg(&mut segs)?;
                let data = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Put {
                    key: key.into(),
                    data: data.into(),
                })
            }

            "get" => {
                let key = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Get { key: key.into() })
            }

            "del" => {
                let key = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::Del { key: key.into() })
            }

            "size" => Ok(ReplCommand::Size),

            "getkeys" => Ok(ReplCommand::GetKeys),

            "getts" => {
                let key = Self::expect_next_seg(&mut segs)?;
                Ok(ReplCommand::GetTs { key: key.into() })
            }

            "help" => Ok(ReplCommand::PrintHelp),

            "quit" | "exit" => Ok(ReplCommand::Exit),

            _ => Err(QuorumKvError(format!(
                "unrecognized command: {}",
                cmd_type
            ))),
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, QuorumKvError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }
        Self::parse_command(&self.input_buf)
    }

    /// Issues the command to the service and returns a printable result.
    async fn eval_command(
        table: &mut QuorumTable,
        cmd: ReplCommand,
    ) -> Result<String, QuorumKvError> {
        match cmd {
            ReplCommand::Put { key, data } => {
                let ts = table.put(&key, data.as_bytes()).await?;
                Ok(format!("put '{}' at ts {}", key, ts))
            }

            ReplCommand::Get { key } => match table.get(&key).await? {
                Some((payload, ts)) => Ok(format!(
                    "'{}' = '{}' at ts {}",
                    key,
                    String::from_utf8_lossy(&payload),
                    ts
                )),
                None => Ok(format!("'{}' not found", key)),
            },

            ReplCommand::Del { key } => {
                let ts = table.del(&key).await?;
                Ok(format!("deleted '{}' at ts {}", key, ts))
            }

            ReplCommand::Size => Ok(format!("size {}", table.size().await?)),

            ReplCommand::GetKeys => {
                let keys = table.getkeys().await?;
                Ok(format!("{} keys {:?}", keys.len(), keys))
            }

            ReplCommand::GetTs { key } => Ok(format!(
                "'{}' at ts {}",
                key,
                table.get_timestamp(&key).await?
            )),

            _ => Err(QuorumKvError(format!("not a table command: {:?}", cmd))),
        }
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, QuorumKvError> {
        Self::print_prompt()?;

        let cmd = match self.read_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                Self::print_help(Some(&e));
                return Ok(true);
            }
        };

        match cmd {
            ReplCommand::Exit => {
                println!("Exiting...");
                Ok(false)
            }

            ReplCommand::Nothing => Ok(true),

            ReplCommand::PrintHelp => {
                Self::print_help(None);
                Ok(true)
            }

            cmd => {
                let table = match self.table.as_mut() {
                    Some(table) => table,
                    None => return Err(QuorumKvError::msg("disconnected")),
                };
                let start = Instant::now();
                match Self::eval_command(table, cmd).await {
                    Ok(result) => {
                        let lat_ms = start.elapsed().as_secs_f64() * 1000.0;
                        cprintln!(
                            "<bright-green>✓</> {} <<took {:.2} ms>>",
                            result,
                            lat_ms
                        );
                    }
                    Err(e) => {
                        cprintln!("<bright-red>✗</> {}", e);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Runs the REPL loop until quit or end of input.
    pub async fn run(&mut self) -> Result<(), QuorumKvError> {
        loop {
            match self.iter().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    cprintln!("<bright-red>✗</> {}", e);
                    break;
                }
            }
        }

        if let Some(table) = self.table.take() {
            table.disconnect().await?;
        }
        Ok(())
    }
}

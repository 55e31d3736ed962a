//! Line-oriented control input for the daemon.
//!
//! A single thread owns the reader. Each line goes to the oldest waiting
//! confirmation prompt if there is one; otherwise it is parsed as a command.
//! Prompts and commands therefore never compete for the same input.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::adapters::Simulator;
use crate::core::OrchestratorCommand;

pub const USAGE: &str = "Commands: add <serial> <image> | rm <image> | eject <device> | \
                         rehash <device> | mount <device> | unmount <device> | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Plug a simulated device backed by an image file.
    AddDevice { serial: String, image: PathBuf },
    RemoveDevice(PathBuf),
    Control(OrchestratorCommand),
}

impl ConsoleCommand {
    /// `Ok(None)` for blank lines, `Err` with a hint for anything unrecognised.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = match parts.as_slice() {
            [] => return Ok(None),
            ["add", serial, image] => Self::AddDevice {
                serial: serial.to_string(),
                image: PathBuf::from(image),
            },
            ["rm", image] => Self::RemoveDevice(PathBuf::from(image)),
            ["eject", device] => Self::Control(OrchestratorCommand::Eject(device.into())),
            ["rehash", device] => Self::Control(OrchestratorCommand::Rehash(device.into())),
            ["mount", device] => Self::Control(OrchestratorCommand::Mount(device.into())),
            ["unmount", device] => Self::Control(OrchestratorCommand::Unmount(device.into())),
            ["quit" | "exit"] => Self::Control(OrchestratorCommand::Shutdown),
            _ => return Err(format!("Unrecognised input '{}'. {USAGE}", line.trim())),
        };
        Ok(Some(command))
    }
}

#[derive(Default)]
struct Waiters {
    queue: VecDeque<oneshot::Sender<String>>,
    closed: bool,
}

/// Handle for asking questions on the shared input.
#[derive(Clone, Default)]
pub struct Console {
    waiters: Arc<Mutex<Waiters>>,
}

impl Console {
    /// Start the reader thread over `reader`.
    pub fn spawn<R>(reader: R) -> (Self, mpsc::UnboundedReceiver<ConsoleCommand>)
    where
        R: BufRead + Send + 'static,
    {
        let console = Self::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = console.clone();
        std::thread::spawn(move || shared.read_lines(reader, tx));
        (console, rx)
    }

    pub fn stdin() -> (Self, mpsc::UnboundedReceiver<ConsoleCommand>) {
        Self::spawn(BufReader::new(std::io::stdin()))
    }

    /// Print `question` and wait for the next input line. `None` once input has ended.
    pub async fn ask(&self, question: &str) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            if waiters.closed {
                return None;
            }
            waiters.queue.push_back(tx);
        }
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{question} [y/N]: ");
        let _ = stdout.flush();
        rx.await.ok()
    }

    pub fn pending_prompts(&self) -> usize {
        self.waiters.lock().queue.len()
    }

    fn read_lines<R: BufRead>(&self, reader: R, commands: mpsc::UnboundedSender<ConsoleCommand>) {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Console input failed");
                    break;
                }
            };
            let Some(line) = self.answer_prompt(line) else {
                continue;
            };
            match ConsoleCommand::parse(&line) {
                Ok(Some(command)) => {
                    debug!(?command, "Console command");
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(hint) => println!("{hint}"),
            }
        }

        let mut waiters = self.waiters.lock();
        waiters.closed = true;
        waiters.queue.clear();
        debug!("Console input closed");
    }

    /// Hand `line` to the oldest live prompt. Returns it back if nobody is asking.
    fn answer_prompt(&self, mut line: String) -> Option<String> {
        let mut waiters = self.waiters.lock();
        while let Some(waiter) = waiters.queue.pop_front() {
            match waiter.send(line) {
                Ok(()) => return None,
                Err(returned) => line = returned,
            }
        }
        Some(line)
    }
}

/// Route console commands to the orchestrator and, in simulation, the simulator.
pub async fn forward(
    mut commands: mpsc::UnboundedReceiver<ConsoleCommand>,
    control: mpsc::Sender<OrchestratorCommand>,
    simulator: Option<Simulator>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            ConsoleCommand::AddDevice { serial, image } => match &simulator {
                Some(simulator) => {
                    simulator.add_device(&serial, image);
                }
                None => warn!("Adding devices requires simulation mode"),
            },
            ConsoleCommand::RemoveDevice(image) => match &simulator {
                Some(simulator) => simulator.remove_device(image),
                None => warn!("Removing devices requires simulation mode"),
            },
            ConsoleCommand::Control(command) => {
                if control.send(command).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            ConsoleCommand::parse("eject /dev/sdb1"),
            Ok(Some(ConsoleCommand::Control(OrchestratorCommand::Eject(
                "/dev/sdb1".into()
            ))))
        );
        assert_eq!(
            ConsoleCommand::parse("  add SIM1 /tmp/stick.img "),
            Ok(Some(ConsoleCommand::AddDevice {
                serial: "SIM1".into(),
                image: "/tmp/stick.img".into(),
            }))
        );
        assert_eq!(
            ConsoleCommand::parse("rm /tmp/stick.img"),
            Ok(Some(ConsoleCommand::RemoveDevice("/tmp/stick.img".into())))
        );
        assert_eq!(
            ConsoleCommand::parse("quit"),
            Ok(Some(ConsoleCommand::Control(OrchestratorCommand::Shutdown)))
        );
        assert_eq!(ConsoleCommand::parse("   "), Ok(None));
    }

    #[test]
    fn test_parse_rejects_bad_arity() {
        assert!(ConsoleCommand::parse("eject").is_err());
        assert!(ConsoleCommand::parse("mount a b").is_err());
        assert!(ConsoleCommand::parse("y").is_err());
    }

    #[tokio::test]
    async fn test_dropped_prompt_does_not_swallow_line() {
        let console = Console::default();
        let (tx, rx) = oneshot::channel();
        console.waiters.lock().queue.push_back(tx);
        drop(rx);

        assert_eq!(console.answer_prompt("eject /dev/sdb1".into()).as_deref(), Some("eject /dev/sdb1"));
        assert_eq!(console.pending_prompts(), 0);
    }
}

use std::fmt;
use std::time::Duration;

use pocket_core::power::{LockFlag, SleepState};
use pocket_core::{InputChannel, Level, TickRate, Ticks};
use winnow::ModalResult;
use winnow::ascii::{alpha1, alphanumeric1, dec_uint, space0, space1};
use winnow::combinator::{alt, eof, opt, preceded, terminated};
use winnow::prelude::*;

use crate::sim::Simulator;

const DEFAULT_BOUNCE_EDGES: u8 = 3;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "press",
        "press <channel> [for <duration>] - drive a channel high, optionally releasing it later",
    ),
    (
        "release",
        "release <channel>                - drive a channel low",
    ),
    (
        "bounce",
        "bounce <channel> [edges]         - chatter a channel before it settles on the other level",
    ),
    (
        "run",
        "run <duration>                   - advance simulated time (e.g. `run 250ms`, `run 2s`)",
    ),
    (
        "lock",
        "lock <run|s1|s2|s3>              - hold a console lock capping the sleep depth",
    ),
    (
        "unlock",
        "unlock <run|s1|s2|s3>            - release the console lock",
    ),
    (
        "status",
        "status                           - show time, queue, locks, inputs and sleep residency",
    ),
    (
        "help",
        "help [topic]                     - show help for a command",
    ),
];

/// Parsed REPL command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Press {
        channel: InputChannel,
        hold: Option<Duration>,
    },
    Release {
        channel: InputChannel,
    },
    Bounce {
        channel: InputChannel,
        edges: Option<u8>,
    },
    Run(Duration),
    Lock(SleepState),
    Unlock(SleepState),
    Status,
    Help(Option<String>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    Syntax { offset: usize },
    UnknownTopic(String),
    DurationTooLong(Duration),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Syntax { offset } => write!(f, "syntax error at column {}", offset + 1),
            CommandError::UnknownTopic(topic) => write!(f, "no help for `{topic}`"),
            CommandError::DurationTooLong(duration) => {
                write!(f, "duration {}ms exceeds the timer range", duration.as_millis())
            }
        }
    }
}

/// Parses one REPL line. Keywords are case-insensitive.
///
/// # Errors
///
/// Returns [`CommandError::Syntax`] with the offset of the first unparsed
/// character.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let lowered = line.trim().to_ascii_lowercase();
    terminated(command, (space0, eof))
        .parse(lowered.as_str())
        .map_err(|error| CommandError::Syntax {
            offset: error.offset(),
        })
}

fn command(input: &mut &str) -> ModalResult<Command> {
    alt((
        preceded(
            ("press", space1),
            (channel, opt(preceded((space1, "for", space1), duration))),
        )
        .map(|(channel, hold)| Command::Press { channel, hold }),
        preceded(("release", space1), channel).map(|channel| Command::Release { channel }),
        preceded(
            ("bounce", space1),
            (channel, opt(preceded(space1, dec_uint))),
        )
        .map(|(channel, edges): (InputChannel, Option<u8>)| {
            Command::Bounce { channel, edges }
        }),
        preceded(("run", space1), duration).map(Command::Run),
        preceded(("lock", space1), sleep_state).map(Command::Lock),
        preceded(("unlock", space1), sleep_state).map(Command::Unlock),
        "status".value(Command::Status),
        preceded("help", opt(preceded(space1, alpha1)))
            .map(|topic: Option<&str>| Command::Help(topic.map(str::to_owned))),
    ))
    .parse_next(input)
}

fn channel(input: &mut &str) -> ModalResult<InputChannel> {
    alpha1.verify_map(InputChannel::from_label).parse_next(input)
}

fn sleep_state(input: &mut &str) -> ModalResult<SleepState> {
    alphanumeric1
        .verify_map(|label: &str| {
            SleepState::ALL
                .into_iter()
                .find(|state| state.label() == label)
        })
        .parse_next(input)
}

fn duration(input: &mut &str) -> ModalResult<Duration> {
    (dec_uint, opt(alt(("ms", "s"))))
        .map(|(value, unit): (u64, Option<&str>)| match unit {
            Some("s") => Duration::from_secs(value),
            _ => Duration::from_millis(value),
        })
        .parse_next(input)
}

pub struct Session {
    sim: Simulator,
    console_locks: [LockFlag; SleepState::COUNT],
}

impl Session {
    pub fn new(rate: TickRate) -> Self {
        Self {
            sim: Simulator::new(rate),
            console_locks: [LockFlag::new(); SleepState::COUNT],
        }
    }

    pub fn handle_command(&mut self, line: &str) -> Vec<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        match parse(trimmed).and_then(|command| self.execute(command)) {
            Ok(lines) => lines,
            Err(error) => vec![format!("ERR {error}")],
        }
    }

    fn execute(&mut self, command: Command) -> Result<Vec<String>, CommandError> {
        let mut lines = Vec::new();
        match command {
            Command::Press { channel, hold } => {
                let hold = hold.map(|hold| self.ticks(hold)).transpose()?;
                self.sim.drive(channel, Level::High, hold);
                lines.push(format!("OK {channel} high"));
            }
            Command::Release { channel } => {
                self.sim.drive(channel, Level::Low, None);
                lines.push(format!("OK {channel} low"));
            }
            Command::Bounce { channel, edges } => {
                let edges = edges.unwrap_or(DEFAULT_BOUNCE_EDGES);
                self.sim.bounce(channel, edges);
                lines.push(format!("OK {channel} bouncing ({edges} edges)"));
            }
            Command::Run(duration) => {
                let ticks = self.ticks(duration)?;
                self.sim.run_for(ticks);
                lines.extend(self.sim.drain_log());
                lines.push(format!("OK ran {}ms", duration.as_millis()));
            }
            Command::Lock(state) => {
                let flag = &mut self.console_locks[state.as_index()];
                if flag.is_held() {
                    lines.push(format!("OK {state} already locked"));
                } else {
                    self.sim.power().lock_max_state(state, flag);
                    lines.push(format!("OK locked {state}; max {}", self.sim.power().max_state()));
                }
            }
            Command::Unlock(state) => {
                let flag = &mut self.console_locks[state.as_index()];
                if flag.is_held() {
                    self.sim.power().unlock_max_state(state, flag);
                    lines.push(format!(
                        "OK unlocked {state}; max {}",
                        self.sim.power().max_state()
                    ));
                } else {
                    lines.push(format!("OK {state} was not locked"));
                }
            }
            Command::Status => lines.extend(self.status_lines()),
            Command::Help(topic) => lines.extend(help_lines(topic.as_deref())?),
        }
        Ok(lines)
    }

    fn ticks(&self, duration: Duration) -> Result<Ticks, CommandError> {
        let rate = self.sim.rate();
        // Instants only order correctly within half the counter range.
        let limit = u128::from(rate.millis_from_ticks(Ticks::MAX / 2));
        if duration.as_millis() > limit {
            return Err(CommandError::DurationTooLong(duration));
        }
        let millis = u32::try_from(duration.as_millis())
            .map_err(|_| CommandError::DurationTooLong(duration))?;
        Ok(rate.ticks_from_millis(millis))
    }

    fn status_lines(&self) -> Vec<String> {
        let status = self.sim.status();
        let mut lines = vec![format!(
            "time {}ms ({} ticks)",
            status.millis,
            status.now.ticks()
        )];

        let locks = SleepState::ALL
            .iter()
            .map(|state| format!("{state}={}", status.locks[state.as_index()]))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("max-state {} locks {locks}", status.max_state));

        if status.queue.is_empty() {
            lines.push("queue (empty)".to_string());
        } else {
            lines.push(format!("queue {}", status.queue.join(", ")));
        }

        let inputs = status
            .inputs
            .iter()
            .map(|(channel, level)| match level {
                Some(level) => format!("{channel}={level}"),
                None => format!("{channel}=detached"),
            })
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("inputs {inputs}"));

        let total = u64::from(status.now.ticks()).max(1);
        let slept: u64 = status.residency.ticks.iter().sum();
        let awake = total.saturating_sub(slept);
        let mut residency = vec![format!("awake {}%", awake * 100 / total)];
        for state in SleepState::SLEEPING {
            let index = state.as_index();
            residency.push(format!(
                "{state} {}% ({} entries)",
                status.residency.ticks[index] * 100 / total,
                status.residency.entries[index]
            ));
        }
        lines.push(format!("residency {}", residency.join(", ")));

        lines.push(format!(
            "clients render={} frames, emulation={} slices ({} yields)",
            status.frames, status.emulation.slices, status.emulation.yields
        ));
        lines
    }
}

fn help_lines(topic: Option<&str>) -> Result<Vec<String>, CommandError> {
    match topic {
        None => {
            let mut lines = vec!["Commands:".to_string()];
            lines.extend(HELP_TOPICS.iter().map(|(_, usage)| format!("  {usage}")));
            lines.push("Channels: left, middle, right, charging, vbus".to_string());
            Ok(lines)
        }
        Some(topic) => HELP_TOPICS
            .iter()
            .find(|(name, _)| *name == topic)
            .map(|(_, usage)| vec![(*usage).to_string()])
            .ok_or_else(|| CommandError::UnknownTopic(topic.to_string())),
    }
}

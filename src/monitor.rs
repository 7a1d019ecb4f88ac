//! The kernel monitor: a rudimentary command shell for inspecting the
//! scheduler's state.
//!
//! A core drops into the monitor when there is nothing left to run anywhere
//! in the system. The monitor keeps the kernel lock for as long as it runs,
//! so every command sees the same snapshot, and it never returns.
use crate::{
    cpu::Cpu,
    env::{Env, EnvId, Status},
    kernel::{KernelGuard, State},
};
use core::fmt::{self, Write};
use hal_core::Architecture;
use maitake_sync::blocking::RawMutex;

/// What a command can look at.
#[derive(Debug)]
pub struct Context<'a> {
    pub state: &'a State,
    pub cpus: &'a [Cpu],
    pub arch: &'static str,
}

pub type Handler = for<'cmd> fn(&'cmd str, &Context<'_>) -> Result<(), Error<'cmd>>;

pub struct Command {
    pub name: &'static str,
    pub help: &'static str,
    pub func: Option<Handler>,
    pub subcommands: Option<&'static [Command]>,
}

#[derive(Debug)]
pub struct Error<'a> {
    line: &'a str,
    kind: ErrorKind<'a>,
}

#[derive(Debug)]
enum ErrorKind<'a> {
    UnknownCommand(&'a [Command]),

    SubcommandRequired {
        name: &'static str,
        subcommands: &'a [Command],
    },
    InvalidArguments(&'static str),
    Other(&'static str),
}

pub static COMMANDS: &[Command] = &[
    Command::new("kerninfo")
        .with_help("print information about the kernel")
        .with_fn(|_, ctx| {
            tracing::info!(
                arch = ctx.arch,
                version = env!("CARGO_PKG_VERSION"),
                envs = ctx.state.envs().capacity(),
                cpus = ctx.cpus.len(),
                "{} kernel",
                env!("CARGO_PKG_NAME"),
            );
            Ok(())
        }),
    Command::new("envs")
        .with_help("list live environments")
        .with_subcommands(&[
            Command::new("all")
                .with_help("list every slot in the table, including free ones")
                .with_fn(|_, ctx| {
                    list_envs(ctx, |_| true);
                    Ok(())
                }),
            Command::new("runnable")
                .with_help("list environments waiting for a core")
                .with_fn(|_, ctx| {
                    list_envs(ctx, |env| env.status() == Status::Runnable);
                    Ok(())
                }),
        ])
        .with_fn(|line, ctx| {
            if !line.is_empty() {
                return Err(Error::invalid_argument(line, "envs [all|runnable]"));
            }
            list_envs(ctx, |env| env.status() != Status::Free);
            Ok(())
        }),
    Command::new("env")
        .with_help("print one environment, by hexadecimal ID")
        .with_fn(|line, ctx| {
            let bits = u32::from_str_radix(line.trim_start_matches("0x"), 16)
                .map_err(|_| Error::invalid_argument(line, "env <hex id>"))?;
            let env = ctx
                .state
                .envs()
                .get(EnvId::from_u32(bits))
                .map_err(|_| Error::other(line, "no such environment"))?;
            tracing::info!(env = ?env);
            Ok(())
        }),
    Command::new("cpus")
        .with_help("list CPU cores and what they last ran")
        .with_fn(|_, ctx| {
            for cpu in ctx.cpus {
                tracing::info!(
                    cpu = %cpu.id(),
                    status = %cpu.status(),
                    stack_top = %cpu.stack_top(),
                    current = ?ctx.state.current(cpu.id()),
                );
            }
            Ok(())
        }),
];

/// Runs the kernel monitor forever, reading commands from `arch`'s console.
pub fn run<L, A>(guard: KernelGuard<'_, L>, cpus: &[Cpu], arch: &A) -> !
where
    L: RawMutex,
    A: Architecture,
{
    let ctx = Context {
        state: &guard,
        cpus,
        arch: A::NAME,
    };
    tracing::info!("entering the kernel monitor; type 'help' for a list of commands");

    let mut buf = [0u8; 256];
    loop {
        let line = arch.read_line(&mut buf);
        eval(line, &ctx);
    }
}

/// Evaluates one line of monitor input, logging any error.
pub fn eval(line: &str, ctx: &Context<'_>) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    tracing::debug!("executing monitor command: {line:?}");

    if line == "help" {
        tracing::info!("available commands:");
        print_help(COMMANDS);
        return;
    }

    if let Err(error) = handle_command(line, COMMANDS, ctx) {
        tracing::warn!("could not execute {line:?}: {error}");
    }
}

pub fn handle_command<'cmd>(
    line: &'cmd str,
    commands: &'cmd [Command],
    ctx: &Context<'_>,
) -> Result<(), Error<'cmd>> {
    let line = line.trim();
    let (name, rest) = line.split_once(' ').unwrap_or((line, ""));
    match commands.iter().find(|cmd| cmd.name == name) {
        Some(cmd) => cmd.run(rest, ctx),
        None => Err(Error::unknown_command(line, commands)),
    }
}

fn list_envs(ctx: &Context<'_>, filter: impl Fn(&Env) -> bool) {
    for env in ctx.state.envs().iter().filter(|env| filter(env)) {
        tracing::info!(
            slot = env.id().slot(),
            id = %env.id(),
            status = %env.status(),
            cpu = ?env.cpu(),
            runs = env.runs(),
        );
    }
}

fn print_help(commands: &[Command]) {
    for Command { name, help, .. } in commands {
        tracing::info!(" - {name}: {help}");
    }
}

// === impl Command ===

impl Command {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            help: "",
            func: None,
            subcommands: None,
        }
    }

    pub const fn with_help(self, help: &'static str) -> Self {
        Self { help, ..self }
    }

    pub const fn with_subcommands(self, subcommands: &'static [Command]) -> Self {
        Self {
            subcommands: Some(subcommands),
            ..self
        }
    }

    pub const fn with_fn(self, func: Handler) -> Self {
        Self {
            func: Some(func),
            ..self
        }
    }

    pub fn run<'cmd>(&self, line: &'cmd str, ctx: &Context<'_>) -> Result<(), Error<'cmd>> {
        let line = line.trim();

        if line == "help" {
            tracing::info!("{self}");
            if let Some(subcommands) = self.subcommands {
                tracing::info!("subcommands:");
                print_help(subcommands);
            }
            return Ok(());
        }

        if let Some(subcommands) = self.subcommands {
            match (handle_command(line, subcommands, ctx), self.func) {
                (
                    Err(Error {
                        kind: ErrorKind::UnknownCommand(_),
                        ..
                    }),
                    Some(func),
                ) => return func(line, ctx),
                (result, _) => return result,
            }
        }

        match self.func {
            Some(func) => func(line, ctx),
            None => Err(Error::subcommand_required(
                line,
                self.name,
                self.subcommands.unwrap_or(&[]),
            )),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            func,
            name,
            help,
            subcommands,
        } = self;
        f.debug_struct("Command")
            .field("name", name)
            .field("help", help)
            .field("func", &func.map(|func| func as *const ()))
            .field("subcommands", subcommands)
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.help)
    }
}

// === impl Error ===

impl<'a> Error<'a> {
    fn unknown_command(line: &'a str, commands: &'a [Command]) -> Self {
        Self {
            line,
            kind: ErrorKind::UnknownCommand(commands),
        }
    }

    fn subcommand_required(line: &'a str, name: &'static str, subcommands: &'a [Command]) -> Self {
        Self {
            line,
            kind: ErrorKind::SubcommandRequired { name, subcommands },
        }
    }

    pub fn invalid_argument(line: &'a str, help: &'static str) -> Self {
        Self {
            line,
            kind: ErrorKind::InvalidArguments(help),
        }
    }

    pub fn other(line: &'a str, msg: &'static str) -> Self {
        Self {
            line,
            kind: ErrorKind::Other(msg),
        }
    }

    pub fn is_unknown_command(&self) -> bool {
        matches!(self.kind, ErrorKind::UnknownCommand(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidArguments(_))
    }
}

impl fmt::Display for Error<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::UnknownCommand(commands) => {
                f.write_str("unknown command, expected one of: [")?;
                comma_delimited(f, commands.iter().map(|Command { name, .. }| name))?;
                f.write_char(']')?;
            }
            ErrorKind::InvalidArguments(help) => {
                write!(f, "invalid arguments: {:?}, usage: {help}", self.line)?
            }
            ErrorKind::SubcommandRequired { name, subcommands } => {
                write!(
                    f,
                    "the '{name}' command requires one of the following subcommands: ["
                )?;
                comma_delimited(f, subcommands.iter().map(|Command { name, .. }| name))?;
                f.write_char(']')?;
            }
            ErrorKind::Other(msg) => write!(f, "{msg} ({:?})", self.line)?,
        }

        Ok(())
    }
}

fn comma_delimited<F: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    values: impl IntoIterator<Item = F>,
) -> fmt::Result {
    let mut values = values.into_iter();
    if let Some(first) = values.next() {
        write!(f, "{first}")?;
        for value in values {
            write!(f, ", {value}")?;
        }
    }
    Ok(())
}

use {
    clap::Parser,
    ninep::{
        client::Session,
        fcall::{NINEP_PORT, Stat},
        io_err, sched, transport,
        utils::Result,
    },
    std::io::Write,
    tokio::io::{AsyncRead, AsyncWrite},
};

mod shell;

#[derive(Debug, Parser)]
#[command(name = "npcl", about = "A 9P2000 command-line client")]
struct Cli {
    /// TCP/IP address to connect to
    #[arg(short, long)]
    address: Option<String>,

    /// TCP/IP port to connect to
    #[arg(short, long, default_value_t = NINEP_PORT)]
    port: u16,

    /// Unix socket path to connect to
    #[arg(short, long)]
    named: Option<String>,

    /// User name to attach as
    #[arg(short, long, default_value = "none")]
    uname: String,

    /// Print sent and received messages
    #[arg(short, long)]
    debug: bool,

    /// Print version information
    #[arg(short = 'v', long = "version")]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// List directories
    Ls { paths: Vec<String> },
    /// Print a file
    Cat { file: String },
    /// Write a string to a file, truncating it first
    Write { data: String, file: String },
    /// Remove a file
    Rm { name: String },
    /// Remove a directory
    Rmdir { name: String },
    /// Describe a file
    Stat { name: String },
    /// Create a file
    Create { name: String, perm: String },
    /// Create a directory
    Mkdir { name: String, perm: String },
    /// Change a file's permission bits
    Chmod { perm: String, name: String },
    /// Interactive shell
    Sh,
}

fn main() {
    let mut cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    if cli.version {
        println!("npcl {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let Some(command) = cli.command.take() else {
        let _ = <Cli as clap::CommandFactory>::command().print_help();
        std::process::exit(-1);
    };

    let exit_code = match sched::Runtime::new() {
        Ok(rt) => rt.block_on(client_main(&cli, command)),
        Err(e) => {
            eprintln!("Error: {}", e);
            -1
        }
    };

    std::process::exit(exit_code);
}

async fn client_main(cli: &Cli, command: Command) -> i32 {
    let dial = if let Some(address) = &cli.address {
        format!("tcp!{}!{}", address, cli.port)
    } else if let Some(named) = &cli.named {
        format!("unix!{}", named)
    } else {
        eprintln!("Incomplete connection information provided");
        return -1;
    };

    let result = async {
        let stream = transport::connect(&dial).await?;
        let mut session = Session::attach(stream, &cli.uname, "").await?;
        run(&mut session, command).await?;
        session.detach().await
    }
    .await;

    result.map(|_| 0).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    })
}

async fn run<S>(session: &mut Session<S>, command: Command) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match command {
        Command::Ls { paths } => cmd_ls(session, &paths).await,
        Command::Cat { file } => cmd_cat(session, &file).await,
        Command::Write { data, file } => cmd_write(session, &data, &file).await,
        Command::Rm { name } | Command::Rmdir { name } => cmd_rm(session, &name).await,
        Command::Stat { name } => cmd_stat(session, &name).await,
        Command::Create { name, perm } => cmd_create(session, &name, &perm, false).await,
        Command::Mkdir { name, perm } => cmd_create(session, &name, &perm, true).await,
        Command::Chmod { perm, name } => cmd_chmod(session, &perm, &name).await,
        Command::Sh => shell::repl(session).await,
    }
}

/// Dispatch a tokenized shell line. Returns false when the command name is
/// unknown; command failures are reported and do not end the shell.
async fn dispatch<S>(session: &mut Session<S>, args: &[String]) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = match args[0].as_str() {
        "ls" => cmd_ls(session, &args[1..]).await,
        "cat" => match args {
            [_, file] => cmd_cat(session, file).await,
            _ => usage("cat <file>"),
        },
        "write" => match args {
            [_, data, file] => cmd_write(session, data, file).await,
            _ => usage("write <data> <file>"),
        },
        "rm" | "rmdir" => match args {
            [_, name] => cmd_rm(session, name).await,
            _ => usage("rm <name>"),
        },
        "stat" => match args {
            [_, name] => cmd_stat(session, name).await,
            _ => usage("stat <name>"),
        },
        "create" => match args {
            [_, name, perm] => cmd_create(session, name, perm, false).await,
            _ => usage("create <name> <perm>"),
        },
        "mkdir" => match args {
            [_, name, perm] => cmd_create(session, name, perm, true).await,
            _ => usage("mkdir <name> <perm>"),
        },
        "chmod" => match args {
            [_, perm, name] => cmd_chmod(session, perm, name).await,
            _ => usage("chmod <perm> <name>"),
        },
        "help" => {
            print_commands();
            Ok(())
        }
        _ => return false,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
    }
    true
}

fn usage(u: &str) -> Result<()> {
    println!("Usage: {}", u);
    Ok(())
}

fn print_commands() {
    println!("ls <directories>");
    println!("cat <file>");
    println!("write <data> <file>");
    println!("rm <name>");
    println!("rmdir <name>");
    println!("stat <name>");
    println!("create <name> <perm>");
    println!("mkdir <name> <perm>");
    println!("chmod <perm> <name>");
    println!("sh");
    println!("help");
}

/// Permissions parse like strtol with base 0: 0x hex, leading 0 octal,
/// decimal otherwise.
fn parse_perm(s: &str) -> Result<u32> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o") {
        (oct, 8)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };

    u32::from_str_radix(digits, radix)
        .map_err(|_| From::from(io_err!(InvalidInput, format!("bad permission '{}'", s))))
}

fn format_time(secs: u32) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%c").to_string())
        .unwrap_or_else(|| secs.to_string())
}

async fn cmd_ls<S>(session: &mut Session<S>, paths: &[String]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let root = [String::new()];
    let paths: &[String] = if paths.is_empty() { &root } else { paths };

    for (i, path) in paths.iter().enumerate() {
        if paths.len() > 1 {
            if i > 0 {
                println!();
            }
            println!("{}:", path);
        }
        match session.read_dir(path).await {
            Ok(stats) => {
                for stat in stats {
                    println!(
                        "{:>11o} {} {} {} {:>20} {}",
                        stat.mode,
                        stat.uid,
                        stat.gid,
                        format_time(stat.atime),
                        stat.length,
                        stat.name
                    );
                }
            }
            // Keep going: remaining arguments may still list fine.
            Err(e) => eprintln!("{}: {}", path, e),
        }
    }
    Ok(())
}

async fn cmd_cat<S>(session: &mut Session<S>, file: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = session.read_file(file).await?;
    let mut stdout = std::io::stdout();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

async fn cmd_write<S>(session: &mut Session<S>, data: &str, file: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.write_file(file, data.as_bytes()).await
}

async fn cmd_rm<S>(session: &mut Session<S>, name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.remove(name).await
}

async fn cmd_stat<S>(session: &mut Session<S>, name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stat: Stat = session.stat(name).await?;
    println!(
        "{:>4x} {:>8x} {:>2x} {:>8x} {:>16x} {:>11o} {} {} {:>20} {} {} {} {}",
        stat.typ,
        stat.dev,
        stat.qid.typ.bits(),
        stat.qid.version,
        stat.qid.path,
        stat.mode,
        format_time(stat.atime),
        format_time(stat.mtime),
        stat.length,
        stat.name,
        stat.uid,
        stat.gid,
        stat.muid
    );
    Ok(())
}

async fn cmd_create<S>(session: &mut Session<S>, name: &str, perm: &str, dir: bool) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let perm = parse_perm(perm)?;
    if dir {
        session.mkdir(name, perm).await?;
    } else {
        session.create(name, perm).await?;
    }
    Ok(())
}

async fn cmd_chmod<S>(session: &mut Session<S>, perm: &str, name: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let perm = parse_perm(perm)?;
    session.chmod(name, perm).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_perm_bases() {
        assert_eq!(parse_perm("644").unwrap(), 644);
        assert_eq!(parse_perm("0644").unwrap(), 0o644);
        assert_eq!(parse_perm("0o755").unwrap(), 0o755);
        assert_eq!(parse_perm("0x1ff").unwrap(), 0x1ff);
        assert_eq!(parse_perm("0").unwrap(), 0);
        assert!(parse_perm("o644").is_err());
        assert!(parse_perm("").is_err());
    }
}

//! The interactive shell: a line tokenizer, a client-side working
//! directory and the read-eval loop.
//!
//! `cd` walks the attached root fid onto the target directory, so every
//! later command resolves its path against the new location. The prompt's
//! directory string is folded locally from the path elements and never
//! consults the server, so it can diverge from the server's view when
//! the walk crosses symlinks.

use {
    ninep::{client::Session, utils::Result},
    std::io::Write,
    tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
};

pub async fn repl<S>(session: &mut Session<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut cwd = String::from("/");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} $ ", cwd);
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            return Ok(());
        };

        let args = match tokenize(&line) {
            Ok(args) => args,
            Err(e) => {
                println!("Syntax error: {}", e);
                continue;
            }
        };
        let Some(cmd) = args.first() else { continue };

        match cmd.as_str() {
            "cd" => {
                if args.len() < 2 {
                    println!("Not enough arguments");
                } else if args.len() > 2 {
                    println!("Too many arguments");
                } else if args[1].starts_with('/') {
                    println!("Only relative paths are permitted");
                } else {
                    match session.chdir(&args[1]).await {
                        Ok(()) => apply_cwd(&mut cwd, &args[1]),
                        Err(e) => println!("cd: {}", e),
                    }
                }
            }
            "exit" => return Ok(()),
            "sh" => println!("The shell is already running"),
            _ => {
                if !crate::dispatch(session, &args).await {
                    println!("{}: command not found", cmd);
                }
            }
        }
    }
}

/// Fold a successfully walked relative path into the prompt string:
/// `.` changes nothing, `..` pops one element and stops at the root.
fn apply_cwd(cwd: &mut String, path: &str) {
    for seg in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if seg == ".." {
            if let Some(i) = cwd.rfind('/') {
                cwd.truncate(if i == 0 { 1 } else { i });
            }
        } else {
            if cwd != "/" {
                cwd.push('/');
            }
            cwd.push_str(seg);
        }
    }
}

/// Split a command line into arguments.
///
/// Blanks separate arguments; double quotes, single quotes and backslash
/// escapes group them. Inside double quotes a backslash only escapes `"`
/// and `\`. An unterminated quote or a trailing backslash is a syntax
/// error.
fn tokenize(input: &str) -> std::result::Result<Vec<String>, &'static str> {
    enum State {
        Blank,
        Word,
        Quote,
        Apos,
    }

    let mut args = Vec::new();
    let mut cur = String::new();
    let mut state = State::Blank;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Blank => match c {
                ' ' | '\t' => {}
                '\\' => {
                    cur.push(chars.next().ok_or("unexpected end of line")?);
                    state = State::Word;
                }
                '"' => state = State::Quote,
                '\'' => state = State::Apos,
                _ => {
                    cur.push(c);
                    state = State::Word;
                }
            },
            State::Word => match c {
                ' ' | '\t' => {
                    args.push(std::mem::take(&mut cur));
                    state = State::Blank;
                }
                '\\' => cur.push(chars.next().ok_or("unexpected end of line")?),
                '"' => state = State::Quote,
                '\'' => state = State::Apos,
                _ => cur.push(c),
            },
            State::Quote => match c {
                '"' => state = State::Word,
                '\\' => {
                    let next = chars.next().ok_or("unexpected end of line")?;
                    if next != '"' && next != '\\' {
                        cur.push('\\');
                    }
                    cur.push(next);
                }
                _ => cur.push(c),
            },
            State::Apos => match c {
                '\'' => state = State::Word,
                _ => cur.push(c),
            },
        }
    }

    match state {
        State::Quote | State::Apos => Err("unterminated quote"),
        State::Word => {
            args.push(cur);
            Ok(args)
        }
        State::Blank => Ok(args),
    }
}

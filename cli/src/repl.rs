use crate::driver::Driver;
use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::Path;

const HISTORY_FILE: &str = ".declare_history";

pub fn start(driver: &mut Driver) -> Result<()> {
    let mut rl = DefaultEditor::new().context("failed to initialize the line editor")?;
    if rl.load_history(HISTORY_FILE).is_err() {
        // No history yet
    }

    println!("declare v{}", env!("CARGO_PKG_VERSION"));
    println!("Type :help for commands, :quit or Ctrl-D to leave.");

    // Commands may span several lines; input is buffered until the
    // parentheses balance.
    let mut buffer = String::new();
    loop {
        let prompt = match (buffer.is_empty(), driver.current_proof()) {
            (false, _) => "...> ".to_string(),
            (true, Some(name)) => format!("{}> ", name),
            (true, None) => "declare> ".to_string(),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                if buffer.is_empty() {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(trimmed);
                    if trimmed.starts_with(':') {
                        if !meta_command(driver, trimmed) {
                            break;
                        }
                        continue;
                    }
                } else {
                    let _ = rl.add_history_entry(line.trim());
                }
                buffer.push_str(&line);
                buffer.push('\n');
                if depth(&buffer) > 0 {
                    continue;
                }
                let input = std::mem::take(&mut buffer);
                report(driver.run_source(&input));
            }
            Err(ReadlineError::Interrupted) => {
                if buffer.is_empty() {
                    println!("CTRL-C");
                    break;
                }
                buffer.clear();
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    report(driver.finish());
    if let Err(err) = rl.save_history(HISTORY_FILE) {
        tracing::debug!(%err, "could not save history");
    }
    Ok(())
}

/// Returns false when the REPL should stop.
fn meta_command(driver: &mut Driver, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts[0] {
        ":quit" | ":exit" => return false,
        ":help" => {
            println!("Available commands:");
            println!("  :quit, :exit    Exit the REPL");
            println!("  :help           Show this help message");
            println!("  :load <file>    Run every command in a file");
            println!("  :goals          Show the goals of the open proof");
            println!("  :join           Wait for deferred proofs and register them");
            println!("Anything else is read as commands, for example (theorem t A) or (qed).");
        }
        ":load" => match parts.get(1) {
            Some(path) => report(driver.run_file(Path::new(path))),
            None => println!("Usage: :load <file>"),
        },
        ":goals" => {
            for line in driver.goal_lines() {
                println!("{}", line);
            }
        }
        ":join" => report(driver.run_source("(join)")),
        _ => println!("Unknown command. Type :help for help."),
    }
    true
}

fn report(result: Result<Vec<String>>) {
    match result {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
        }
        Err(err) => println!("Error: {:#}", err),
    }
}

/// Open parentheses not yet closed, ignoring `;` comments.
fn depth(input: &str) -> i64 {
    let mut depth = 0;
    for line in input.lines() {
        for c in line.chars() {
            match c {
                ';' => break,
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
        }
    }
    depth
}

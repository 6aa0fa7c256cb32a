// File: src/repl.rs
//
// Interactive REPL for Cinder. One VM lives for the whole session, so
// globals and interned strings carry across inputs. Input with unbalanced
// braces, brackets, or parentheses continues on the next line.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::scanner::Dialect;
use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new(dialect: Dialect) -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(dialect), editor })
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", "cinder interactive shell".bright_cyan());
        println!("{}", "Ctrl+D exits; unclosed braces continue on the next line.".dimmed());

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() {
                "cinder> ".bright_green().to_string()
            } else {
                "   ...> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());
                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        // REPL errors are already reported; the session
                        // just continues.
                        let _ = self.vm.interpret(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!();
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }
}

/// A line continues when a delimiter or string is still open. Comments mask
/// delimiters through the end of their line.
fn is_input_complete(input: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut in_comment = false;
    let mut prev = '\0';

    for ch in input.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            prev = ch;
            continue;
        }
        match ch {
            '"' => in_string = !in_string,
            '/' if !in_string && prev == '/' => in_comment = true,
            '(' | '{' if !in_string => depth += 1,
            ')' | '}' if !in_string => depth -= 1,
            _ => {}
        }
        prev = ch;
    }

    !in_string && depth <= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_input_is_complete() {
        assert!(is_input_complete("print 1;\n"));
        assert!(is_input_complete("fun f() { return 1; }\n"));
    }

    #[test]
    fn open_delimiters_continue() {
        assert!(!is_input_complete("fun f() {\n"));
        assert!(!is_input_complete("print (1 +\n"));
        assert!(!is_input_complete("var s = \"unfinished\n"));
    }

    #[test]
    fn comments_hide_braces() {
        assert!(is_input_complete("print 1; // {\n"));
    }
}

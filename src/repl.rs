// Interactive REPL. Generalized from the teacher's `src/repl.rs`
// (`rustyline::DefaultEditor`, multi-line brace-balance continuation,
// `:help`/`:quit` commands) to drive a persistent `VM` instead of the
// tree-walking interpreter: each complete chunk of input is fed straight to
// `VM::interpret`, which already owns printing (via its `print` statement)
// and error reporting (via `errors::CompileError`/`RuntimeError`'s `colored`
// Display impls), so this module's job shrinks to editing and framing.

use crate::vm::VM;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: VM,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: VM::new(), editor })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!(
            "{}",
            "║         ruffvm REPL - Interactive Shell             ║".bright_cyan()
        );
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!(
            "  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Multi-line input: end with unclosed braces", "Tip:".bright_magenta());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            // Determine prompt based on whether we're in multi-line mode
            let prompt = if buffer.is_empty() {
                "ruff> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if self.is_input_complete(&buffer) {
                        let trimmed = buffer.trim();
                        if !trimmed.is_empty() {
                            self.vm.interpret(&buffer);
                        }
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
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

    /// Returns true to continue the REPL, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                // Clear the screen
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.vm = VM::new();
                println!("{}", "Environment reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    /// Displays help information about available commands
    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h     ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q     ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c    ".dimmed());
        println!("  {}{}  Reset the VM (fresh globals and heap)", ":reset".bright_yellow(), " or :r   ".dimmed());
        println!();
        println!("{}", "Navigation:".bright_cyan().bold());
        println!();
        println!("  {}  Navigate command history", "↑/↓ arrows".bright_blue());
        println!("  {}  Interrupt current input", "Ctrl+C    ".bright_blue());
        println!("  {}  Exit REPL", "Ctrl+D    ".bright_blue());
        println!();
        println!("{}", "Multi-line Input:".bright_cyan().bold());
        println!();
        println!("  Leave braces, brackets, or parentheses unclosed to continue");
        println!("  on the next line. Close them to run the statement.");
        println!();
        println!("{}", "Examples:".bright_cyan().bold());
        println!();
        println!("  {}", "ruff> print 1 + 2;".dimmed());
        println!("  {}", "ruff> fun greet(name) {".dimmed());
        println!("  {}", "....>     print \"Hello, \" + name;".dimmed());
        println!("  {}", "....> }".dimmed());
        println!("  {}", "ruff> greet(\"World\");".dimmed());
        println!();
    }

    /// Returns true if all brackets/braces/parentheses are balanced and we
    /// are not mid-string, i.e. the buffer is ready to hand to the compiler.
    fn is_input_complete(&self, input: &str) -> bool {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return true;
        }

        let mut brace_count = 0i32;
        let mut bracket_count = 0i32;
        let mut paren_count = 0i32;
        let mut in_string = false;
        let mut escape_next = false;
        let mut in_comment = false;
        let mut prev_was_slash = false;

        for ch in trimmed.chars() {
            if in_comment {
                if ch == '\n' {
                    in_comment = false;
                }
                continue;
            }

            if escape_next {
                escape_next = false;
                prev_was_slash = false;
                continue;
            }

            match ch {
                '\\' if in_string => {
                    escape_next = true;
                }
                '"' => {
                    in_string = !in_string;
                }
                '/' if !in_string && prev_was_slash => {
                    in_comment = true;
                }
                '{' if !in_string => brace_count += 1,
                '}' if !in_string => brace_count -= 1,
                '[' if !in_string => bracket_count += 1,
                ']' if !in_string => bracket_count -= 1,
                '(' if !in_string => paren_count += 1,
                ')' if !in_string => paren_count -= 1,
                _ => {}
            }
            prev_was_slash = ch == '/' && !in_string;
        }

        !in_string && brace_count <= 0 && bracket_count <= 0 && paren_count <= 0
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("Failed to create REPL")
    }
}

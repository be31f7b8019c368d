//! Confirmation prompt.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Ask a yes/no question on the terminal. End of input counts as no.
pub fn confirm(question: &str) -> Result<bool, ReadlineError> {
    let mut rl = DefaultEditor::new()?;
    loop {
        match rl.readline(&format!("{} [y/N] ", question)) {
            Ok(line) => match parse_answer(&line) {
                Some(answer) => return Ok(answer),
                None => println!("Please answer y or n."),
            },
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "" | "n" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("y"), Some(true));
        assert_eq!(parse_answer(" YES "), Some(true));
        assert_eq!(parse_answer(""), Some(false));
        assert_eq!(parse_answer("no"), Some(false));
        assert_eq!(parse_answer("maybe"), None);
    }
}

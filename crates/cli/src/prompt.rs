//! Interactive y/N consent on the controlling terminal.

use minikit::Consent;
use std::io::{BufRead, Write};

pub struct PromptConsent {
    assume_yes: bool,
}

impl PromptConsent {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Consent for PromptConsent {
    fn confirm(&self, prompt: &str) -> bool {
        if self.assume_yes {
            eprintln!("{prompt} [y/N] y");
            return true;
        }
        eprint!("{prompt} [y/N] ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

//! Output control: verbosity-aware logging used uniformly by the orchestrator,
//! registry client, and cache instead of scattered `println!` calls.

use std::io::{self, Write};
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct OutputManager {
    verbose: bool,
    quiet: bool,
    start_time: Instant,
}

impl OutputManager {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            start_time: Instant::now(),
        }
    }

    pub fn quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
            start_time: Instant::now(),
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn verbose_msg(&self, message: &str) {
        if self.verbose && !self.quiet {
            println!("  {message}");
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("{message}");
        }
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("done: {message}");
        }
    }

    pub fn warning(&self, message: &str) {
        if !self.quiet {
            eprintln!("warning: {message}");
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }

    pub fn section(&self, title: &str) {
        if !self.quiet {
            println!("\n{title}");
            println!("{}", "-".repeat(title.len()));
        }
    }

    pub fn progress(&self, message: &str) {
        if !self.quiet {
            print!("{message}...");
            let _ = io::stdout().flush();
        }
    }

    pub fn progress_done(&self) {
        if !self.quiet {
            println!(" ok");
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for OutputManager {
    fn default() -> Self {
        Self::new(false)
    }
}

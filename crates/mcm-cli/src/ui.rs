use colored::Colorize;

// ---------------------------------------------------------------------------
// Colored message helpers
// ---------------------------------------------------------------------------

fn prefix() -> String {
    "[mcm]".bold().cyan().to_string()
}

/// Print an informational message: [mcm] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message: [mcm] message (in green)
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print an error message: [mcm] ERROR: message (in red)
pub fn error(msg: &str) {
    eprintln!("{} {}", "[mcm]".bold().red(), msg.red());
}

/// Print a warning message: [mcm] message (in yellow)
pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}

// ---------------------------------------------------------------------------
// Batch outcomes
// ---------------------------------------------------------------------------

/// Summarise a fan-out: "created 2 of 3 vms".
pub fn batch_summary(verb: &str, noun: &str, succeeded: usize, total: usize) {
    let line = format!("{} {} of {} {}", verb, succeeded, total, noun);
    if succeeded == total {
        success(&line);
    } else if succeeded == 0 {
        error(&line);
    } else {
        warn(&line);
    }
}

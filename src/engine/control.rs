/// Commands accepted by a [`RunController`](crate::engine::controller::RunController)
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Ramp to `users` at `rate` users/second (current rate when omitted)
    Start { users: usize, rate: Option<f64> },
    /// Graceful stop of every virtual user
    Stop,
    /// Zero all statistics
    ResetStats,
    /// Request the current report
    Stats,
}

/// Parse a control command from user input
pub fn parse_control_command(input: &str) -> Option<ControlCommand> {
    let input = input.trim();
    let parts: Vec<&str> = input.split_whitespace().collect();

    if parts.is_empty() {
        return None;
    }

    match parts[0].to_lowercase().as_str() {
        "start" | "swarm" | "ramp" | "scale" => {
            let users = parts.get(1)?.parse::<usize>().ok()?;
            let rate = match parts.get(2) {
                Some(r) => Some(r.parse::<f64>().ok().filter(|r| r.is_finite() && *r > 0.0)?),
                None => None,
            };
            Some(ControlCommand::Start { users, rate })
        }
        "reset" => Some(ControlCommand::ResetStats),
        "status" | "stats" => Some(ControlCommand::Stats),
        "stop" | "quit" | "exit" => Some(ControlCommand::Stop),
        _ => None,
    }
}

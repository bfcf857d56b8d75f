use crossbeam_channel::Sender;
use std::{ io::{ self, BufRead }, sync::Arc, thread };

use crate::logger::Logger;
use crate::rhythm::Event;
use crate::{ log_debug, log_info };

/// Turns one line of stdin into events. Words are separated by whitespace:
/// `a` taps lane key `a` (press then release), `a+` presses, `a-` releases,
/// `reset` restarts the run and `quit` ends it.
pub fn parse_line(line: &str) -> Vec<Event> {
    let mut out = Vec::new();
    for word in line.split_whitespace() {
        match word.to_lowercase().as_str() {
            "reset" => out.push(Event::Reset),
            "quit" | "exit" => out.push(Event::Shutdown),
            w => {
                if let Some(key) = w.strip_suffix('+').filter(|k| !k.is_empty()) {
                    out.push(Event::Key { key: key.to_string(), pressed: true });
                } else if let Some(key) = w.strip_suffix('-').filter(|k| !k.is_empty()) {
                    out.push(Event::Key { key: key.to_string(), pressed: false });
                } else {
                    out.push(Event::Key { key: w.to_string(), pressed: true });
                    out.push(Event::Key { key: w.to_string(), pressed: false });
                }
            }
        }
    }
    out
}

/// Reads stdin on its own thread until EOF or until the dispatcher goes away.
pub fn spawn_stdin_reader(events: Sender<Event>, logger: Arc<Logger>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            for event in parse_line(&line) {
                let _ = log_debug!(logger, "input: {:?}", event);
                if events.send(event).is_err() {
                    return;
                }
            }
        }
        let _ = log_info!(logger, "stdin closed; keyboard input disabled");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(events: &[Event]) -> Vec<(String, bool)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Key { key, pressed } => Some((key.clone(), *pressed)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tap_press_release() {
        let ev = parse_line("a k+ L-");
        assert_eq!(
            keys(&ev),
            vec![
                ("a".to_string(), true),
                ("a".to_string(), false),
                ("k".to_string(), true),
                ("l".to_string(), false)
            ]
        );
    }

    #[test]
    fn commands() {
        assert!(matches!(parse_line("reset").as_slice(), [Event::Reset]));
        assert!(matches!(parse_line("  QUIT ").as_slice(), [Event::Shutdown]));
        assert!(parse_line("   ").is_empty());
    }

    #[test]
    fn lone_symbols_are_taps() {
        // "+" alone is a token, not a press of an empty key
        assert_eq!(keys(&parse_line("+")), vec![("+".to_string(), true), ("+".to_string(), false)]);
    }
}

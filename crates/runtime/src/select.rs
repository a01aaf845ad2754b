//! Select support
//!
//! A blocking `select` runs one worker task per case; each sends exactly
//! one message into a shared channel. Positive indices announce a
//! winner, [`SELECT_RESTART`] re-enters the whole select, and
//! [`SELECT_DONE`] marks one case as finished without a value (a
//! timeout handler that chose not to retry, or a cancelled take).

use crate::value::Value;
use std::sync::mpsc::Receiver;

/// A timed-out case's `restart()` cancels the round and re-enters.
pub const SELECT_RESTART: i64 = -1;
/// The case finished without producing a value.
pub const SELECT_DONE: i64 = -2;

/// Wait for a select round to resolve: the first winner or restart wins
/// immediately; otherwise the round ends when all `n` cases are done.
pub fn select_wait(rx: &Receiver<(i64, Value)>, n: usize) -> (i64, Value) {
    let mut done = 0;
    loop {
        match rx.recv() {
            Ok((idx, val)) => {
                if idx == SELECT_DONE {
                    done += 1;
                    if done >= n {
                        return (SELECT_DONE, val);
                    }
                    continue;
                }
                return (idx, val);
            }
            // All senders gone without a winner.
            Err(_) => return (SELECT_DONE, Value::I64(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_winner_short_circuits() {
        let (tx, rx) = channel();
        tx.send((SELECT_DONE, Value::I64(0))).unwrap();
        tx.send((1, Value::I64(42))).unwrap();
        assert_eq!(select_wait(&rx, 3), (1, Value::I64(42)));
    }

    #[test]
    fn test_all_done_resolves() {
        let (tx, rx) = channel();
        for _ in 0..2 {
            tx.send((SELECT_DONE, Value::I64(0))).unwrap();
        }
        assert_eq!(select_wait(&rx, 2).0, SELECT_DONE);
    }

    #[test]
    fn test_disconnected_resolves() {
        let (tx, rx) = channel::<(i64, Value)>();
        drop(tx);
        assert_eq!(select_wait(&rx, 4).0, SELECT_DONE);
    }
}

//! Subscription state: channel sets, cursor, and the generation counter that
//! guards cursor updates against superseded requests.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::protocol::PRESENCE_SUFFIX;
use crate::types::SubscribeOperation;

/// Server-issued position in the message stream. `timetoken == 0` means "now".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub timetoken: u64,
    pub region: Option<u32>,
}

/// Everything the loop needs to build one subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SubscribeSnapshot {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub cursor: Cursor,
    pub filter_expression: Option<String>,
    pub generation: u64,
}

/// Channels/groups to heartbeat, snapshotted on each tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeartbeatTicket {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub interval: Duration,
}

/// Entries removed by an unsubscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Removed {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
}

impl Removed {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.groups.is_empty()
    }

    /// Removed names the server tracks occupancy for (presence twins excluded).
    pub fn leave_targets(&self) -> (Vec<String>, Vec<String>) {
        (occupied(&self.channels), occupied(&self.groups))
    }
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionState {
    channels: BTreeSet<String>,
    presence_channels: BTreeSet<String>,
    groups: BTreeSet<String>,
    presence_groups: BTreeSet<String>,
    cursor: Cursor,
    filter_expression: Option<String>,
    generation: u64,
    catch_up: Option<u64>,
    announce: bool,
}

impl SubscriptionState {
    /// Merge a subscribe operation. Returns `true` if anything changed.
    pub fn add(&mut self, op: &SubscribeOperation) -> bool {
        let mut changed = false;
        for ch in &op.channels {
            changed |= self.channels.insert(ch.clone());
            if op.presence_enabled && !is_presence(ch) {
                changed |= self.presence_channels.insert(presence_name(ch));
            }
        }
        for cg in &op.channel_groups {
            changed |= self.groups.insert(cg.clone());
            if op.presence_enabled && !is_presence(cg) {
                changed |= self.presence_groups.insert(presence_name(cg));
            }
        }
        if op.filter_expression.is_some() && op.filter_expression != self.filter_expression {
            self.filter_expression = op.filter_expression.clone();
            changed = true;
        }
        if let Some(tt) = op.timetoken {
            self.catch_up = Some(tt);
            self.cursor = Cursor::default();
            changed = true;
        }
        if changed {
            self.generation += 1;
            self.announce = true;
        }
        changed
    }

    /// Remove channels/groups together with their presence twins.
    pub fn remove(&mut self, channels: &[String], groups: &[String]) -> Removed {
        let removed = Removed {
            channels: remove_names(&mut self.channels, &mut self.presence_channels, channels),
            groups: remove_names(&mut self.groups, &mut self.presence_groups, groups),
        };
        if !removed.is_empty() {
            self.generation += 1;
        }
        removed
    }

    pub fn clear(&mut self) -> Removed {
        let removed = Removed {
            channels: self.all_channels(),
            groups: self.all_groups(),
        };
        self.channels.clear();
        self.presence_channels.clear();
        self.groups.clear();
        self.presence_groups.clear();
        self.filter_expression = None;
        self.catch_up = None;
        self.announce = false;
        self.reset_cursor();
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
            && self.presence_channels.is_empty()
            && self.groups.is_empty()
            && self.presence_groups.is_empty()
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = Cursor::default();
        self.generation += 1;
    }

    /// Prepare for a new loop: handshake from "now" and announce on success.
    pub fn prepare_fresh_start(&mut self) {
        self.reset_cursor();
        self.announce = true;
    }

    pub fn snapshot(&self) -> SubscribeSnapshot {
        SubscribeSnapshot {
            channels: self.all_channels(),
            groups: self.all_groups(),
            cursor: self.cursor,
            filter_expression: self.filter_expression.clone(),
            generation: self.generation,
        }
    }

    /// Advance the cursor from a response to a request issued at `generation`.
    ///
    /// Returns `None` (cursor untouched) if the state moved on since the request
    /// was built, otherwise whether a `Connected` announcement is pending.
    pub fn apply(&mut self, generation: u64, cursor: Cursor) -> Option<bool> {
        if generation != self.generation {
            return None;
        }
        self.cursor = match self.catch_up.take() {
            Some(timetoken) if self.cursor.timetoken == 0 => Cursor {
                timetoken,
                region: cursor.region,
            },
            _ => cursor,
        };
        Some(std::mem::take(&mut self.announce))
    }

    pub fn heartbeat_ticket(&self, interval: Duration) -> Option<HeartbeatTicket> {
        let channels = occupied(self.channels.iter());
        let groups = occupied(self.groups.iter());
        if channels.is_empty() && groups.is_empty() {
            return None;
        }
        Some(HeartbeatTicket {
            channels,
            groups,
            interval,
        })
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Data and presence channels, sorted and deduplicated.
    pub fn all_channels(&self) -> Vec<String> {
        self.channels
            .union(&self.presence_channels)
            .cloned()
            .collect()
    }

    pub fn all_groups(&self) -> Vec<String> {
        self.groups
            .union(&self.presence_groups)
            .cloned()
            .collect()
    }
}

pub(crate) fn presence_name(name: &str) -> String {
    format!("{name}{PRESENCE_SUFFIX}")
}

fn is_presence(name: &str) -> bool {
    name.ends_with(PRESENCE_SUFFIX)
}

fn occupied<'a>(names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| !is_presence(name))
        .cloned()
        .collect()
}

fn remove_names(
    data: &mut BTreeSet<String>,
    presence: &mut BTreeSet<String>,
    names: &[String],
) -> Vec<String> {
    let mut removed = Vec::new();
    for name in names {
        if data.remove(name) {
            removed.push(name.clone());
        }
        let twin = if is_presence(name) {
            name.clone()
        } else {
            presence_name(name)
        };
        if presence.remove(&twin) && !removed.contains(&twin) {
            removed.push(twin);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn add_is_idempotent() {
        let mut state = SubscriptionState::default();
        assert!(state.add(&SubscribeOperation::channels(["a", "b"])));
        let generation = state.generation();
        assert!(!state.add(&SubscribeOperation::channels(["a"])));
        assert_eq!(state.generation(), generation);
        assert_eq!(state.all_channels(), names(&["a", "b"]));
    }

    #[test]
    fn presence_enabled_adds_twins() {
        let mut state = SubscriptionState::default();
        state.add(
            &SubscribeOperation::channels(["a"])
                .with_groups(["cg"])
                .with_presence(),
        );
        assert_eq!(state.all_channels(), names(&["a", "a-pnpres"]));
        assert_eq!(state.all_groups(), names(&["cg", "cg-pnpres"]));
    }

    #[test]
    fn remove_takes_presence_twin() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a", "b"]).with_presence());
        let removed = state.remove(&names(&["a"]), &[]);
        assert_eq!(removed.channels, names(&["a", "a-pnpres"]));
        assert_eq!(removed.leave_targets(), (names(&["a"]), Vec::new()));
        assert_eq!(state.all_channels(), names(&["b", "b-pnpres"]));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a"]));
        let generation = state.generation();
        let removed = state.remove(&names(&["zzz"]), &names(&["cg"]));
        assert!(removed.is_empty());
        assert_eq!(state.generation(), generation);
    }

    #[test]
    fn active_set_is_union_of_adds_minus_removes() {
        let mut state = SubscriptionState::default();
        let mut model: HashSet<String> = HashSet::new();
        let script: &[(bool, &[&str])] = &[
            (true, &["a", "b", "c"]),
            (false, &["b"]),
            (true, &["d", "b"]),
            (false, &["a", "x"]),
            (true, &["a"]),
            (false, &["c", "d"]),
        ];
        for (add, chans) in script {
            let chans = names(chans);
            if *add {
                state.add(&SubscribeOperation::channels(chans.clone()));
                model.extend(chans);
            } else {
                state.remove(&chans, &[]);
                for ch in &chans {
                    model.remove(ch);
                }
            }
            // interleave a loop iteration applying a cursor
            let snapshot = state.snapshot();
            state.apply(
                snapshot.generation,
                Cursor {
                    timetoken: snapshot.cursor.timetoken + 1,
                    region: Some(1),
                },
            );
            let active: HashSet<String> = state.all_channels().into_iter().collect();
            assert_eq!(active, model);
        }
        let mut expected: Vec<String> = model.into_iter().collect();
        expected.sort();
        assert_eq!(state.all_channels(), expected);
    }

    #[test]
    fn apply_advances_cursor_atomically() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a"]));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.cursor, Cursor::default());
        let announce = state.apply(
            snapshot.generation,
            Cursor {
                timetoken: 100,
                region: Some(2),
            },
        );
        assert_eq!(announce, Some(true));
        assert_eq!(
            state.snapshot().cursor,
            Cursor {
                timetoken: 100,
                region: Some(2)
            }
        );
        // announcement is consumed
        let generation = state.generation();
        assert_eq!(state.apply(generation, Cursor::default()), Some(false));
    }

    #[test]
    fn stale_generation_does_not_advance_cursor() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a"]));
        let generation = state.generation();
        state.apply(
            generation,
            Cursor {
                timetoken: 10,
                region: Some(1),
            },
        );

        let stale = state.snapshot();
        state.add(&SubscribeOperation::channels(["b"]));
        let result = state.apply(
            stale.generation,
            Cursor {
                timetoken: 999,
                region: Some(9),
            },
        );
        assert_eq!(result, None);
        assert_eq!(
            state.cursor(),
            Cursor {
                timetoken: 10,
                region: Some(1)
            }
        );
    }

    #[test]
    fn channel_change_keeps_cursor() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a"]));
        let generation = state.generation();
        state.apply(
            generation,
            Cursor {
                timetoken: 10,
                region: Some(1),
            },
        );
        state.add(&SubscribeOperation::channels(["b"]));
        assert_eq!(state.snapshot().cursor.timetoken, 10);
    }

    #[test]
    fn catch_up_timetoken_replaces_handshake_timetoken() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a"]).with_timetoken(555));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.cursor.timetoken, 0);
        state.apply(
            snapshot.generation,
            Cursor {
                timetoken: 900,
                region: Some(4),
            },
        );
        assert_eq!(
            state.cursor(),
            Cursor {
                timetoken: 555,
                region: Some(4)
            }
        );
    }

    #[test]
    fn fresh_start_resets_cursor_and_invalidates_in_flight() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a"]));
        let generation = state.generation();
        state.apply(
            generation,
            Cursor {
                timetoken: 10,
                region: Some(1),
            },
        );
        state.prepare_fresh_start();
        assert_eq!(state.cursor(), Cursor::default());
        assert_eq!(state.apply(generation, Cursor::default()), None);
    }

    #[test]
    fn heartbeat_ticket_excludes_presence_entries() {
        let mut state = SubscriptionState::default();
        assert_eq!(state.heartbeat_ticket(Duration::from_secs(5)), None);

        state.add(&SubscribeOperation::channels(["a-pnpres"]));
        assert_eq!(state.heartbeat_ticket(Duration::from_secs(5)), None);

        state.add(
            &SubscribeOperation::channels(["a"])
                .with_groups(["cg"])
                .with_presence(),
        );
        let ticket = state.heartbeat_ticket(Duration::from_secs(5)).unwrap();
        assert_eq!(ticket.channels, names(&["a"]));
        assert_eq!(ticket.groups, names(&["cg"]));
        assert_eq!(ticket.interval, Duration::from_secs(5));
    }

    #[test]
    fn clear_returns_everything() {
        let mut state = SubscriptionState::default();
        state.add(
            &SubscribeOperation::channels(["a"])
                .with_groups(["cg"])
                .with_presence(),
        );
        let removed = state.clear();
        assert_eq!(removed.channels, names(&["a", "a-pnpres"]));
        assert_eq!(removed.groups, names(&["cg", "cg-pnpres"]));
        assert!(state.is_empty());
        assert_eq!(state.cursor(), Cursor::default());
    }

    #[test]
    fn filter_expression_change_bumps_generation() {
        let mut state = SubscriptionState::default();
        state.add(&SubscribeOperation::channels(["a"]));
        let generation = state.generation();
        assert!(state.add(&SubscribeOperation::channels(["a"]).with_filter_expression("x == 1")));
        assert!(state.generation() > generation);
        assert_eq!(state.snapshot().filter_expression.as_deref(), Some("x == 1"));
    }
}

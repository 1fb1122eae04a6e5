use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// A mergeable field value with its own last-write timestamp (unix ms).
/// Every field that participates in conflict resolution carries this shape,
/// in memory, on disk, and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamped<T> {
    pub value: T,
    pub updated_at: u64,
}

impl<T> Stamped<T> {
    pub fn new(value: T, updated_at: u64) -> Self {
        Self { value, updated_at }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<i64>,
}

/// Per content item replicated preferences, keyed by item URL in the
/// snapshot. `last_watched_at` is merged by max rather than LWW since it is
/// monotonic by nature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserItemData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite: Option<Stamped<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<Stamped<bool>>,
    /// Percentage, 0-100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_progress: Option<Stamped<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_watched_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Stamped<TrackSelection>>,
}

/// Per-device presentation choices. Replicated snapshots may carry them but
/// the merge always keeps the local side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePrefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_layout: Option<String>,
}

/// Full replicated user-data state for one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataSnapshot {
    #[serde(default)]
    pub items: HashMap<String, UserItemData>,
    #[serde(default)]
    pub hidden_groups: BTreeSet<String>,
    #[serde(default)]
    pub sticky_groups: BTreeSet<String>,
    #[serde(default)]
    pub local: DevicePrefs,
}

/// Pure last-write-wins merge of two snapshots. Ties on `updated_at` keep
/// the local value, which is what makes re-applying the same remote
/// snapshot a no-op. Group sets merge by union; `local` never merges.
pub fn merge(local: &UserDataSnapshot, remote: &UserDataSnapshot) -> UserDataSnapshot {
    let mut items = HashMap::with_capacity(local.items.len().max(remote.items.len()));

    for url in local.items.keys().chain(remote.items.keys()) {
        if items.contains_key(url) {
            continue;
        }
        let merged = match (local.items.get(url), remote.items.get(url)) {
            (Some(l), Some(r)) => merge_item(l, r),
            (Some(l), None) => l.clone(),
            (None, Some(r)) => r.clone(),
            (None, None) => unreachable!("url came from one of the two maps"),
        };
        items.insert(url.clone(), merged);
    }

    UserDataSnapshot {
        items,
        hidden_groups: local.hidden_groups.union(&remote.hidden_groups).cloned().collect(),
        sticky_groups: local.sticky_groups.union(&remote.sticky_groups).cloned().collect(),
        local: local.local.clone(),
    }
}

fn merge_item(local: &UserItemData, remote: &UserItemData) -> UserItemData {
    UserItemData {
        favorite: pick(&local.favorite, &remote.favorite),
        hidden: pick(&local.hidden, &remote.hidden),
        watch_progress: pick(&local.watch_progress, &remote.watch_progress),
        last_watched_at: match (local.last_watched_at, remote.last_watched_at) {
            (Some(l), Some(r)) => Some(l.max(r)),
            (l, r) => l.or(r),
        },
        tracks: pick(&local.tracks, &remote.tracks),
    }
}

fn pick<T: Clone>(local: &Option<Stamped<T>>, remote: &Option<Stamped<T>>) -> Option<Stamped<T>> {
    match (local, remote) {
        (Some(l), Some(r)) => {
            if r.updated_at > l.updated_at {
                Some(r.clone())
            } else {
                Some(l.clone())
            }
        }
        (Some(l), None) => Some(l.clone()),
        (None, Some(r)) => Some(r.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(favorite: Option<(bool, u64)>, progress: Option<(f64, u64)>) -> UserItemData {
        UserItemData {
            favorite: favorite.map(|(v, t)| Stamped::new(v, t)),
            watch_progress: progress.map(|(v, t)| Stamped::new(v, t)),
            ..Default::default()
        }
    }

    fn snapshot(entries: Vec<(&str, UserItemData)>) -> UserDataSnapshot {
        UserDataSnapshot {
            items: entries
                .into_iter()
                .map(|(url, data)| (url.to_string(), data))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn newer_favorite_wins_regardless_of_direction() {
        let a = snapshot(vec![("u1", item(Some((true, 100)), None))]);
        let b = snapshot(vec![("u1", item(Some((false, 200)), None))]);

        let ab = merge(&a, &b);
        let ba = merge(&b, &a);
        assert_eq!(ab.items["u1"].favorite.as_ref().unwrap().value, false);
        assert_eq!(ab.items["u1"].favorite, ba.items["u1"].favorite);
    }

    #[test]
    fn tie_keeps_local() {
        let a = snapshot(vec![("u1", item(Some((true, 100)), None))]);
        let b = snapshot(vec![("u1", item(Some((false, 100)), None))]);
        assert_eq!(merge(&a, &b).items["u1"].favorite.as_ref().unwrap().value, true);
    }

    #[test]
    fn merge_is_idempotent() {
        let a = snapshot(vec![
            ("u1", item(Some((true, 100)), Some((40.0, 90)))),
            ("u2", item(None, Some((12.5, 300)))),
        ]);
        let mut b = snapshot(vec![
            ("u1", item(Some((false, 250)), Some((80.0, 50)))),
            ("u3", item(Some((true, 10)), None)),
        ]);
        b.hidden_groups.insert("Sports".into());

        let once = merge(&a, &b);
        let twice = merge(&once, &b);
        assert_eq!(once, twice);
    }

    #[test]
    fn per_field_resolution_is_independent() {
        // favorite newer on one side, progress newer on the other
        let a = snapshot(vec![("u1", item(Some((true, 500)), Some((10.0, 100))))]);
        let b = snapshot(vec![("u1", item(Some((false, 100)), Some((90.0, 500))))]);

        let merged = merge(&a, &b);
        let got = &merged.items["u1"];
        assert_eq!(got.favorite.as_ref().unwrap().value, true);
        assert_eq!(got.watch_progress.as_ref().unwrap().value, 90.0);
    }

    #[test]
    fn one_sided_items_copy_through() {
        let a = snapshot(vec![("only-a", item(Some((true, 1)), None))]);
        let b = snapshot(vec![("only-b", item(None, Some((55.0, 2))))]);

        let merged = merge(&a, &b);
        assert_eq!(merged.items.len(), 2);
        assert!(merged.items.contains_key("only-a"));
        assert!(merged.items.contains_key("only-b"));
    }

    #[test]
    fn groups_merge_by_union() {
        let mut a = UserDataSnapshot::default();
        a.hidden_groups.insert("News".into());
        a.sticky_groups.insert("Kids".into());
        let mut b = UserDataSnapshot::default();
        b.hidden_groups.insert("News".into());
        b.hidden_groups.insert("Shopping".into());
        b.sticky_groups.insert("Movies".into());

        let merged = merge(&a, &b);
        let expected_hidden: BTreeSet<String> =
            ["News".to_string(), "Shopping".to_string()].into();
        let expected_sticky: BTreeSet<String> =
            ["Kids".to_string(), "Movies".to_string()].into();
        assert_eq!(merged.hidden_groups, expected_hidden);
        assert_eq!(merged.sticky_groups, expected_sticky);
    }

    #[test]
    fn device_prefs_never_merge() {
        let mut a = UserDataSnapshot::default();
        a.local.sort_order = Some("alphabetical".into());
        let mut b = UserDataSnapshot::default();
        b.local.sort_order = Some("recent".into());
        b.local.group_layout = Some("grid".into());

        let merged = merge(&a, &b);
        assert_eq!(merged.local.sort_order.as_deref(), Some("alphabetical"));
        assert_eq!(merged.local.group_layout, None);
    }

    #[test]
    fn last_watched_takes_the_max() {
        let a = snapshot(vec![(
            "u1",
            UserItemData {
                last_watched_at: Some(300),
                ..Default::default()
            },
        )]);
        let b = snapshot(vec![(
            "u1",
            UserItemData {
                last_watched_at: Some(900),
                ..Default::default()
            },
        )]);
        assert_eq!(merge(&a, &b).items["u1"].last_watched_at, Some(900));
    }
}

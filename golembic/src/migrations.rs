use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Error;
use crate::log::LogSink;
use crate::migration::Migration;

/// A linear sequence of migrations, rooted in a single base migration.
///
/// The sequence is stored as a keyed collection (revision to migration)
/// rather than a linked list of owned nodes; `previous` is a name-based
/// reference resolved by lookup. Registration is guarded by a lock so
/// concurrent `register` calls are race-free; the chain walks snapshot the
/// collection and release the lock before walking.
#[derive(Debug)]
pub struct Migrations {
    sequence: Mutex<HashMap<String, Migration>>,
}

impl Migrations {
    /// Create a new sequence rooted in `root`. Fails with
    /// [`Error::NotRoot`] if `root` has a previous revision.
    pub fn new(mut root: Migration) -> Result<Self, Error> {
        if let Some(previous) = root.previous() {
            return Err(Error::NotRoot {
                revision: root.revision().to_owned(),
                previous: previous.to_owned(),
            });
        }

        root.set_serial_id(0);
        let mut sequence = HashMap::new();
        sequence.insert(root.revision().to_owned(), root);
        Ok(Self {
            sequence: Mutex::new(sequence),
        })
    }

    /// Add a migration to the sequence. The migration must have a previous
    /// revision that is already registered, and a revision that is not.
    pub fn register(&self, mut migration: Migration) -> Result<(), Error> {
        let mut sequence = self.sequence.lock();

        let previous = match migration.previous() {
            Some(previous) => previous.to_owned(),
            None => {
                return Err(Error::NoPrevious {
                    revision: migration.revision().to_owned(),
                })
            }
        };

        if !sequence.contains_key(&previous) {
            return Err(Error::PreviousNotRegistered {
                revision: migration.revision().to_owned(),
                previous,
            });
        }

        if sequence.contains_key(migration.revision()) {
            return Err(Error::AlreadyRegistered {
                revision: migration.revision().to_owned(),
            });
        }

        migration.set_serial_id(sequence.len() as u32);
        sequence.insert(migration.revision().to_owned(), migration);
        Ok(())
    }

    /// Register several migrations, in order.
    pub fn register_many(
        &self,
        migrations: impl IntoIterator<Item = Migration>,
    ) -> Result<(), Error> {
        for migration in migrations {
            self.register(migration)?;
        }
        Ok(())
    }

    /// Look up a migration by revision.
    pub fn get(&self, revision: &str) -> Option<Migration> {
        self.sequence.lock().get(revision).cloned()
    }

    pub fn len(&self) -> usize {
        self.sequence.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.lock().is_empty()
    }

    /// Every migration, in order from the root.
    ///
    /// Finds the root, then repeatedly scans for the element whose
    /// `previous` is the current tip. Quadratic in the chain length, which
    /// is fine at the sizes migration sequences reach.
    pub fn all(&self) -> Vec<Migration> {
        let snapshot: Vec<Migration> = self.sequence.lock().values().cloned().collect();

        let mut ordered = Vec::with_capacity(snapshot.len());
        let root = match snapshot.iter().find(|m| m.previous().is_none()) {
            Some(root) => root.clone(),
            None => return ordered,
        };
        ordered.push(root);

        while ordered.len() < snapshot.len() {
            let tip = match ordered.last() {
                Some(tip) => tip.revision().to_owned(),
                None => break,
            };
            match snapshot.iter().find(|m| m.previous() == Some(tip.as_str())) {
                Some(next) => ordered.push(next.clone()),
                None => break,
            }
        }

        ordered
    }

    /// The migrations strictly after `revision`, together with the number of
    /// migrations skipped (the prefix through `revision` itself).
    pub fn since(&self, revision: &str) -> Result<(usize, Vec<Migration>), Error> {
        let mut past_count = 0;
        let mut seen = false;
        let mut tail = Vec::new();

        for migration in self.all() {
            if seen {
                tail.push(migration);
            } else {
                past_count += 1;
                if migration.revision() == revision {
                    seen = true;
                }
            }
        }

        if !seen {
            return Err(Error::MigrationNotRegistered {
                revision: revision.to_owned(),
            });
        }

        Ok((past_count, tail))
    }

    /// The prefix of the sequence ending at (and including) `revision`. The
    /// skipped count is always `0`: the caller is starting from nothing
    /// applied.
    pub fn until(&self, revision: &str) -> Result<(usize, Vec<Migration>), Error> {
        let mut prefix = Vec::new();
        let mut seen = false;

        for migration in self.all() {
            let revision_matches = migration.revision() == revision;
            prefix.push(migration);
            if revision_matches {
                seen = true;
                break;
            }
        }

        if !seen {
            return Err(Error::MigrationNotRegistered {
                revision: revision.to_owned(),
            });
        }

        Ok((0, prefix))
    }

    /// The migrations strictly after `since` up to and including `until`,
    /// together with the number skipped (the prefix through `since`).
    pub fn between(&self, since: &str, until: &str) -> Result<(usize, Vec<Migration>), Error> {
        let mut past_count = 0;
        let mut seen_since = false;
        let mut seen_until = false;
        let mut window = Vec::new();

        for migration in self.all() {
            if !seen_since {
                past_count += 1;
                if migration.revision() == since {
                    seen_since = true;
                }
                continue;
            }

            let revision_matches = migration.revision() == until;
            window.push(migration);
            if revision_matches {
                seen_until = true;
                break;
            }
        }

        if !seen_since {
            return Err(Error::MigrationNotRegistered {
                revision: since.to_owned(),
            });
        }
        if !seen_until {
            return Err(Error::MigrationNotRegistered {
                revision: until.to_owned(),
            });
        }

        Ok((past_count, window))
    }

    /// Print one line per migration, with the revision column padded to the
    /// widest revision.
    pub fn describe(&self, log: &dyn LogSink) {
        let all = self.all();
        let width = all.iter().map(|m| m.revision().len()).max().unwrap_or(0);

        for (index, migration) in all.iter().enumerate() {
            log.log(format_args!(
                "{index} | {revision:width$} | {description}",
                revision = migration.revision(),
                description = migration.extended_description(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use std::fmt;
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct VecLog(Arc<Mutex<Vec<String>>>);

    impl LogSink for VecLog {
        fn log(&self, message: fmt::Arguments<'_>) {
            self.0.lock().push(message.to_string());
        }
    }

    impl VecLog {
        fn lines(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    fn chain(revisions: &[(&str, Option<&str>)]) -> Migrations {
        let mut iter = revisions.iter();
        let (root, previous) = iter.next().expect("at least a root");
        assert!(previous.is_none());

        let sequence = Migrations::new(Migration::new(*root).unwrap()).unwrap();
        for (revision, previous) in iter {
            sequence
                .register(
                    Migration::new(*revision)
                        .unwrap()
                        .with_previous(previous.unwrap()),
                )
                .unwrap();
        }
        sequence
    }

    fn abc() -> Migrations {
        chain(&[("a", None), ("b", Some("a")), ("c", Some("b"))])
    }

    #[test]
    fn root_with_previous_rejected() {
        let root = Migration::new("b").unwrap().with_previous("a");
        let err = Migrations::new(root).unwrap_err();
        assert!(matches!(err, Error::NotRoot { revision, previous }
            if revision == "b" && previous == "a"));
    }

    #[test]
    fn register_requires_previous() {
        let sequence = Migrations::new(Migration::new("a").unwrap()).unwrap();
        let err = sequence.register(Migration::new("b").unwrap()).unwrap_err();
        assert!(matches!(err, Error::NoPrevious { revision } if revision == "b"));
    }

    #[test]
    fn register_requires_previous_registered() {
        let sequence = Migrations::new(Migration::new("a").unwrap()).unwrap();
        let err = sequence
            .register(Migration::new("c").unwrap().with_previous("b"))
            .unwrap_err();
        assert!(matches!(err, Error::PreviousNotRegistered { revision, previous }
            if revision == "c" && previous == "b"));
    }

    #[test]
    fn register_rejects_duplicates() {
        let sequence = abc();
        let err = sequence
            .register(Migration::new("b").unwrap().with_previous("a"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered { revision } if revision == "b"));
    }

    #[test]
    fn all_is_a_total_order_from_the_root() {
        let sequence = chain(&[
            ("a", None),
            ("b", Some("a")),
            ("c", Some("b")),
            ("d", Some("c")),
        ]);

        let all = sequence.all();
        assert_eq!(all.len(), sequence.len());
        let revisions: Vec<&str> = all.iter().map(|m| m.revision()).collect();
        assert_eq!(revisions, vec!["a", "b", "c", "d"]);
        let serial_ids: Vec<u32> = all.iter().map(|m| m.serial_id()).collect();
        assert_eq!(serial_ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn get_round_trips() {
        let sequence = abc();
        assert_eq!(sequence.get("b").unwrap().revision(), "b");
        assert!(sequence.get("z").is_none());
    }

    #[test]
    fn since_skips_the_prefix() {
        let sequence = abc();

        let (past, tail) = sequence.since("a").unwrap();
        assert_eq!(past, 1);
        let revisions: Vec<&str> = tail.iter().map(|m| m.revision()).collect();
        assert_eq!(revisions, vec!["b", "c"]);

        let (past, tail) = sequence.since("c").unwrap();
        assert_eq!(past, 3);
        assert!(tail.is_empty());

        let err = sequence.since("z").unwrap_err();
        assert!(matches!(err, Error::MigrationNotRegistered { revision } if revision == "z"));
    }

    #[test]
    fn until_collects_the_prefix() {
        let sequence = abc();

        let (past, prefix) = sequence.until("b").unwrap();
        assert_eq!(past, 0);
        let revisions: Vec<&str> = prefix.iter().map(|m| m.revision()).collect();
        assert_eq!(revisions, vec!["a", "b"]);

        let err = sequence.until("z").unwrap_err();
        assert!(matches!(err, Error::MigrationNotRegistered { .. }));
    }

    #[test]
    fn between_is_exclusive_inclusive() {
        let sequence = chain(&[
            ("a", None),
            ("b", Some("a")),
            ("c", Some("b")),
            ("d", Some("c")),
        ]);

        let (past, window) = sequence.between("a", "c").unwrap();
        assert_eq!(past, 1);
        let revisions: Vec<&str> = window.iter().map(|m| m.revision()).collect();
        assert_eq!(revisions, vec!["b", "c"]);

        let err = sequence.between("z", "c").unwrap_err();
        assert!(matches!(err, Error::MigrationNotRegistered { revision } if revision == "z"));

        let err = sequence.between("a", "z").unwrap_err();
        assert!(matches!(err, Error::MigrationNotRegistered { revision } if revision == "z"));

        // An endpoint that precedes `since` in the chain is never seen.
        let err = sequence.between("c", "a").unwrap_err();
        assert!(matches!(err, Error::MigrationNotRegistered { revision } if revision == "a"));
    }

    #[test]
    fn describe_aligns_revisions() {
        let sequence = Migrations::new(
            Migration::new("c9b52448285b")
                .unwrap()
                .with_description("Create users table"),
        )
        .unwrap();
        sequence
            .register(
                Migration::new("f1be")
                    .unwrap()
                    .with_previous("c9b52448285b")
                    .with_description("Seed users")
                    .with_milestone(true),
            )
            .unwrap();

        let log = VecLog::default();
        sequence.describe(&log);
        assert_eq!(
            log.lines(),
            vec![
                "0 | c9b52448285b | Create users table",
                "1 | f1be         | Seed users [MILESTONE]",
            ]
        );
    }

    #[test]
    fn register_is_safe_across_threads() {
        let sequence = Arc::new(Migrations::new(Migration::new("a").unwrap()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sequence = Arc::clone(&sequence);
                std::thread::spawn(move || {
                    let migration = Migration::new("b").unwrap().with_previous("a");
                    sequence.register(migration)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let registered = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(registered, 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(Error::AlreadyRegistered { .. }))));
        assert_eq!(sequence.all().len(), 2);
    }
}

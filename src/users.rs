use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{droppable_handle::DroppableHandle, error::TunnelError};

// One allow-list entry. An empty string or `*` in the authfile becomes the
// sentinel that matches every address.
#[derive(Debug, Clone)]
pub(crate) enum AddressPattern {
    Any,
    Matching(Regex),
}

#[derive(Debug, Clone)]
pub(crate) struct User {
    pub(crate) name: String,
    pub(crate) pass: String,
    pub(crate) addrs: Vec<AddressPattern>,
}

impl User {
    // Whether this user may bind or reach the given address. An empty
    // allow-list denies everything.
    pub(crate) fn has_access(&self, addr: &str) -> bool {
        self.addrs.iter().any(|pattern| match pattern {
            AddressPattern::Any => true,
            AddressPattern::Matching(regex) => regex.is_match(addr),
        })
    }
}

// Split a `user:pass` credential string.
pub(crate) fn parse_auth(auth: &str) -> (String, String) {
    match auth.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (auth.to_string(), String::new()),
    }
}

// Credential index consulted by the server's password callback. Optionally
// watches the authfile and atomically swaps in the reloaded map.
pub(crate) struct UserIndex {
    users: Arc<RwLock<HashMap<String, Arc<User>>>>,
    // Task that reloads the file upon filesystem changes.
    _reload_join_handle: Option<DroppableHandle<()>>,
    // Filesystem change watcher.
    _watcher: Option<RecommendedWatcher>,
}

impl UserIndex {
    pub(crate) fn new() -> Self {
        UserIndex {
            users: Arc::new(RwLock::new(HashMap::new())),
            _reload_join_handle: None,
            _watcher: None,
        }
    }

    pub(crate) fn add_user(&self, user: User) {
        self.users
            .write()
            .expect("not poisoned")
            .insert(user.name.clone(), Arc::new(user));
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<User>> {
        self.users
            .read()
            .expect("not poisoned")
            .get(name)
            .map(Arc::clone)
    }

    pub(crate) fn len(&self) -> usize {
        self.users.read().expect("not poisoned").len()
    }

    // Load the authfile once and start watching it for changes. The initial
    // load must succeed; later reload failures log and keep the current map.
    pub(crate) async fn watch(authfile: PathBuf) -> color_eyre::Result<Self> {
        let users = Arc::new(RwLock::new(load_users_file(authfile.as_path()).await?));
        let (watcher, mut file_rx) = watch_file(authfile.as_path())?;
        let users_clone = Arc::clone(&users);
        let reload_join_handle = DroppableHandle(tokio::spawn(async move {
            loop {
                // Wait and debounce
                loop {
                    if file_rx.changed().await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    let Ok(changed) = file_rx.has_changed() else {
                        return;
                    };
                    if !changed {
                        break;
                    }
                }
                match load_users_file(authfile.as_path()).await {
                    Ok(reloaded) => {
                        *users_clone.write().expect("not poisoned") = reloaded;
                        debug!(path = %authfile.display(), "Reloaded users configuration.");
                    }
                    Err(error) => {
                        warn!(path = %authfile.display(), %error, "Failed to reload the users configuration.");
                    }
                }
            }
        }));
        Ok(UserIndex {
            users,
            _reload_join_handle: Some(reload_join_handle),
            _watcher: Some(watcher),
        })
    }
}

// Listen for write-class events on the authfile, coalesced in a watch channel.
fn watch_file(file: &Path) -> color_eyre::Result<(RecommendedWatcher, watch::Receiver<()>)> {
    let (tx, rx) = watch::channel(());
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| {
            if let Ok(event) = result
                && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
            {
                tx.send_replace(());
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(file, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

// The authfile is a JSON object mapping `user:pass` strings to arrays of
// address regexes.
async fn load_users_file(file: &Path) -> color_eyre::Result<HashMap<String, Arc<User>>> {
    let data = tokio::fs::read_to_string(file).await?;
    let raw: HashMap<String, Vec<String>> =
        serde_json::from_str(&data).map_err(|_| TunnelError::InvalidConfig)?;
    let mut users = HashMap::with_capacity(raw.len());
    for (auth, patterns) in raw {
        let (name, pass) = parse_auth(&auth);
        if name.is_empty() {
            return Err(TunnelError::InvalidAuth.into());
        }
        let mut addrs = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if pattern.is_empty() || pattern == "*" {
                addrs.push(AddressPattern::Any);
            } else {
                let regex = Regex::new(&pattern)
                    .map_err(|_| TunnelError::InvalidAddressRegex(pattern.clone()))?;
                addrs.push(AddressPattern::Matching(regex));
            }
        }
        users.insert(name.clone(), Arc::new(User { name, pass, addrs }));
    }
    Ok(users)
}

#[cfg(test)]
mod user_index_tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::{AddressPattern, User, UserIndex, parse_auth};

    fn user_with(patterns: &[&str]) -> User {
        User {
            name: "foo".to_string(),
            pass: "bar".to_string(),
            addrs: patterns
                .iter()
                .map(|pattern| {
                    if pattern.is_empty() || *pattern == "*" {
                        AddressPattern::Any
                    } else {
                        AddressPattern::Matching(regex::Regex::new(pattern).unwrap())
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn empty_allow_list_denies_all() {
        let user = user_with(&[]);
        assert!(!user.has_access("127.0.0.1:22"));
    }

    #[test]
    fn sentinel_allows_all() {
        let user = user_with(&["*"]);
        assert!(user.has_access("127.0.0.1:22"));
        assert!(user.has_access("anything at all"));
    }

    #[test]
    fn patterns_match_addresses() {
        let user = user_with(&["[^:]+:22$"]);
        assert!(user.has_access("myhost:22"));
        assert!(!user.has_access("db:3306"));
        assert!(!user.has_access("R:0.0.0.0:22"));
    }

    #[test]
    fn parses_auth_strings() {
        assert_eq!(
            parse_auth("user:pa:ss"),
            ("user".to_string(), "pa:ss".to_string())
        );
        assert_eq!(parse_auth("user"), ("user".to_string(), String::new()));
    }

    #[tokio::test]
    async fn loads_and_reloads_authfile() {
        let dir = std::env::temp_dir().join("burrow-users-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("authfile.json");
        tokio::fs::write(&path, r#"{"alice:secret": ["[^:]+:22$"]}"#)
            .await
            .unwrap();

        let index = UserIndex::watch(path.clone()).await.unwrap();
        assert_eq!(index.len(), 1);
        let alice = index.get("alice").unwrap();
        assert_eq!(alice.pass, "secret");
        assert!(alice.has_access("host:22"));

        // A broken rewrite keeps the previous map.
        tokio::fs::write(&path, "{not json").await.unwrap();
        sleep(Duration::from_millis(800)).await;
        assert!(index.get("alice").is_some());

        // A valid rewrite swaps the map atomically.
        tokio::fs::write(&path, r#"{"bob:hunter2": ["*"]}"#)
            .await
            .unwrap();
        timeout(Duration::from_secs(5), async {
            while index.get("bob").is_none() {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("reload did not happen");
        assert!(index.get("alice").is_none());
        assert!(index.get("bob").unwrap().has_access("db:3306"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_regex() {
        let dir = std::env::temp_dir().join("burrow-users-invalid");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("authfile.json");
        tokio::fs::write(&path, r#"{"alice:secret": ["["]}"#)
            .await
            .unwrap();
        assert!(UserIndex::watch(path.clone()).await.is_err());
        tokio::fs::remove_file(&path).await.unwrap();
    }
}

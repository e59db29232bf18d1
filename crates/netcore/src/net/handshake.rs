use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub const TOKEN_MAX_AGE: Duration = Duration::from_secs(20);
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_TOKENS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("Connection token expired or invalid, please reconnect")]
    BadToken,
    #[error("{0}")]
    VersionMismatch(String),
    #[error("Server is full")]
    ServerFull,
    #[error("You are banned from this server ({0})")]
    Banned(String),
    #[error("Server is passworded, no password specified or bad password.")]
    BadPassword,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    token: u32,
    addr: SocketAddr,
    issued: Instant,
}

/// Connect tokens handed out with server info.
///
/// A token is bound to the address that asked for it. A connect request
/// must echo it from the same address before `max_age` has passed.
#[derive(Debug)]
pub struct TokenIssuer {
    tokens: Vec<IssuedToken>,
    max_age: Duration,
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new(TOKEN_MAX_AGE)
    }
}

impl TokenIssuer {
    pub fn new(max_age: Duration) -> Self {
        Self {
            tokens: Vec::new(),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn expired(&self, token: &IssuedToken, now: Instant) -> bool {
        now.saturating_duration_since(token.issued) > self.max_age
    }

    pub fn issue(&mut self, addr: SocketAddr, now: Instant) -> u32 {
        let token = loop {
            let candidate = rand::random::<u32>();
            if candidate != 0 && !self.tokens.iter().any(|t| t.token == candidate) {
                break candidate;
            }
        };
        let entry = IssuedToken {
            token,
            addr,
            issued: now,
        };

        let reusable = self.tokens.iter().position(|t| self.expired(t, now));
        match reusable {
            Some(i) => self.tokens[i] = entry,
            None if self.tokens.len() < MAX_TOKENS => self.tokens.push(entry),
            None => {
                let oldest = self
                    .tokens
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, t)| t.issued)
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                self.tokens[oldest] = entry;
            }
        }

        token
    }

    /// Checks a token echoed by `addr`. Tokens are single use: a valid one
    /// is consumed.
    pub fn validate(&mut self, token: u32, addr: SocketAddr, now: Instant) -> bool {
        let Some(index) = self
            .tokens
            .iter()
            .position(|t| t.token == token && t.addr == addr)
        else {
            return false;
        };

        let entry = self.tokens.swap_remove(index);
        now.saturating_duration_since(entry.issued) <= self.max_age
    }

    pub fn prune(&mut self, now: Instant) {
        let max_age = self.max_age;
        self.tokens
            .retain(|t| now.saturating_duration_since(t.issued) <= max_age);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Unconnected,
    AwaitingChallengeResponse,
    Connecting,
    Connected,
    InGame,
}

/// Client side of the handshake.
#[derive(Debug, Clone)]
pub struct ClientState {
    stage: ConnectionStage,
    server: Option<SocketAddr>,
    token: Option<u32>,
    last_attempt: Option<Instant>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            stage: ConnectionStage::Unconnected,
            server: None,
            token: None,
            last_attempt: None,
        }
    }

    pub fn stage(&self) -> ConnectionStage {
        self.stage
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn token(&self) -> Option<u32> {
        self.token
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.stage,
            ConnectionStage::Connected | ConnectionStage::InGame
        )
    }

    pub fn start_connect(&mut self, server: SocketAddr) {
        self.stage = ConnectionStage::AwaitingChallengeResponse;
        self.server = Some(server);
        self.token = None;
        self.last_attempt = None;
    }

    /// Starts over with the last server. False if there never was one.
    pub fn start_reconnect(&mut self) -> bool {
        match self.server {
            Some(server) => {
                self.start_connect(server);
                true
            }
            None => false,
        }
    }

    pub fn can_retry_connect(&self, now: Instant) -> bool {
        self.last_attempt
            .is_none_or(|t| now.saturating_duration_since(t) >= CONNECT_RETRY_INTERVAL)
    }

    pub fn on_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Accepts the token from a server info reply. Ignored unless a
    /// challenge is outstanding.
    pub fn on_got_server_info(&mut self, token: u32) -> bool {
        if self.stage != ConnectionStage::AwaitingChallengeResponse {
            return false;
        }
        self.token = Some(token);
        true
    }

    /// Drops the spent token and goes back to asking for server info.
    pub fn restart_challenge(&mut self) {
        if self.stage == ConnectionStage::Connecting {
            self.stage = ConnectionStage::AwaitingChallengeResponse;
            self.token = None;
            self.last_attempt = None;
        }
    }

    pub fn on_sent_connect(&mut self, now: Instant) {
        self.stage = ConnectionStage::Connecting;
        self.last_attempt = Some(now);
    }

    pub fn on_connected(&mut self) {
        if self.stage == ConnectionStage::Connecting {
            self.stage = ConnectionStage::Connected;
        }
    }

    pub fn on_entered_game(&mut self) {
        if self.stage == ConnectionStage::Connected {
            self.stage = ConnectionStage::InGame;
        }
    }

    /// Keeps the server address for `start_reconnect`.
    pub fn on_disconnect(&mut self) {
        self.stage = ConnectionStage::Unconnected;
        self.token = None;
        self.last_attempt = None;
    }

    pub fn is_valid_address(&self, addr: SocketAddr) -> bool {
        self.stage != ConnectionStage::Unconnected && self.server == Some(addr)
    }
}

/// A resource file the server requires, identified by name and content
/// hash.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct WantedFile {
    pub name: String,
    pub hash: String,
}

impl WantedFile {
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }
}

/// Looks up resource files on the client.
pub trait ResourceResolver {
    fn has_file(&self, file: &WantedFile) -> bool;
}

pub fn missing_files<'a, R: ResourceResolver + ?Sized>(
    resolver: &R,
    files: &'a [WantedFile],
) -> Vec<&'a WantedFile> {
    files.iter().filter(|f| !resolver.has_file(f)).collect()
}

/// Resolves files by name inside a set of directories. An empty hash
/// matches any content.
#[derive(Debug, Clone, Default)]
pub struct DirectoryResolver {
    dirs: Vec<PathBuf>,
}

impl DirectoryResolver {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl ResourceResolver for DirectoryResolver {
    fn has_file(&self, file: &WantedFile) -> bool {
        self.dirs.iter().any(|dir| {
            let path = dir.join(&file.name);
            match fs::read(&path) {
                Ok(bytes) => file.hash.is_empty() || file_digest(&bytes) == file.hash.to_lowercase(),
                Err(_) => false,
            }
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BanList {
    entries: HashMap<IpAddr, String>,
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ban(&mut self, ip: IpAddr, reason: impl Into<String>) {
        self.entries.insert(ip, reason.into());
    }

    pub fn unban(&mut self, ip: &IpAddr) -> bool {
        self.entries.remove(ip).is_some()
    }

    pub fn check(&self, addr: &SocketAddr) -> Result<(), HandshakeError> {
        match self.entries.get(&addr.ip()) {
            Some(reason) => Err(HandshakeError::Banned(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Hex SHA-256 of a resource file.
pub fn file_digest(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

/// What the client sends for a join password. Empty for no password.
pub fn password_digest(password: &str) -> String {
    if password.is_empty() {
        return String::new();
    }
    to_hex(&Sha256::digest(password.as_bytes()))
}

pub fn session_digest() -> String {
    to_hex(&rand::random::<[u8; 16]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_token_bound_to_address() {
        let mut issuer = TokenIssuer::default();
        let now = Instant::now();
        let token = issuer.issue(addr(1000), now);

        assert!(!issuer.validate(token, addr(1001), now));
        assert!(!issuer.validate(token ^ 1, addr(1000), now));
        assert!(issuer.validate(token, addr(1000), now));
    }

    #[test]
    fn test_expired_token_rejected() {
        let mut issuer = TokenIssuer::new(Duration::from_secs(20));
        let now = Instant::now();
        let token = issuer.issue(addr(1000), now);

        assert!(!issuer.validate(token, addr(1000), now + Duration::from_secs(21)));
    }

    #[test]
    fn test_token_single_use() {
        let mut issuer = TokenIssuer::new(Duration::from_secs(20));
        let now = Instant::now();
        let token = issuer.issue(addr(1000), now);

        assert!(issuer.validate(token, addr(1000), now + Duration::from_secs(15)));
        assert!(!issuer.validate(token, addr(1000), now + Duration::from_secs(15)));
        assert!(!issuer.validate(token, addr(1000), now + Duration::from_secs(30)));
        assert_eq!(issuer.len(), 0);
    }

    #[test]
    fn test_replayed_token_never_revives() {
        let mut issuer = TokenIssuer::new(Duration::from_secs(20));
        let now = Instant::now();
        let token = issuer.issue(addr(1000), now);

        let accepted: Vec<u64> = [0, 15, 30, 45, 60, 75]
            .into_iter()
            .filter(|&s| issuer.validate(token, addr(1000), now + Duration::from_secs(s)))
            .collect();
        assert_eq!(accepted, vec![0]);
    }

    #[test]
    fn test_expired_slots_reused() {
        let mut issuer = TokenIssuer::new(Duration::from_secs(1));
        let now = Instant::now();
        issuer.issue(addr(1), now);
        issuer.issue(addr(2), now);
        issuer.issue(addr(3), now + Duration::from_secs(5));
        assert_eq!(issuer.len(), 2);

        issuer.prune(now + Duration::from_secs(5));
        assert_eq!(issuer.len(), 1);
    }

    #[test]
    fn test_client_state_flow() {
        let mut state = ClientState::new();
        let now = Instant::now();
        assert!(!state.start_reconnect());
        assert!(!state.on_got_server_info(5));

        state.start_connect(addr(10666));
        assert_eq!(state.stage(), ConnectionStage::AwaitingChallengeResponse);
        assert!(state.is_valid_address(addr(10666)));
        assert!(!state.is_valid_address(addr(10667)));

        assert!(state.on_got_server_info(42));
        state.on_sent_connect(now);
        assert_eq!(state.stage(), ConnectionStage::Connecting);
        assert_eq!(state.token(), Some(42));

        state.on_entered_game();
        assert_eq!(state.stage(), ConnectionStage::Connecting);
        state.on_connected();
        state.on_entered_game();
        assert_eq!(state.stage(), ConnectionStage::InGame);

        state.on_disconnect();
        assert!(!state.is_valid_address(addr(10666)));
        assert!(state.start_reconnect());
        assert_eq!(state.server(), Some(addr(10666)));
    }

    #[test]
    fn test_retry_backoff() {
        let mut state = ClientState::new();
        let now = Instant::now();
        state.start_connect(addr(10666));
        assert!(state.can_retry_connect(now));

        state.on_attempt(now);
        assert!(!state.can_retry_connect(now + Duration::from_millis(500)));
        assert!(state.can_retry_connect(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_connect_retry_asks_for_new_token() {
        let mut state = ClientState::new();
        let now = Instant::now();
        state.start_connect(addr(10666));
        state.restart_challenge();
        assert_eq!(state.stage(), ConnectionStage::AwaitingChallengeResponse);

        assert!(state.on_got_server_info(7));
        state.on_sent_connect(now);
        state.restart_challenge();
        assert_eq!(state.stage(), ConnectionStage::AwaitingChallengeResponse);
        assert_eq!(state.token(), None);
        assert!(state.can_retry_connect(now));
        assert!(state.on_got_server_info(8));
    }

    struct Have(Vec<&'static str>);

    impl ResourceResolver for Have {
        fn has_file(&self, file: &WantedFile) -> bool {
            self.0.contains(&file.name.as_str())
        }
    }

    #[test]
    fn test_missing_files() {
        let files = vec![WantedFile::new("a.wad", ""), WantedFile::new("b.wad", "")];
        let missing = missing_files(&Have(vec!["a.wad"]), &files);
        assert_eq!(missing, vec![&files[1]]);
    }

    #[test]
    fn test_directory_resolver_checks_hash() {
        let dir = std::env::temp_dir().join(format!("gibnet-res-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("maps.wad"), b"IWAD").unwrap();

        let resolver = DirectoryResolver::new(vec![dir.clone()]);
        assert!(resolver.has_file(&WantedFile::new("maps.wad", file_digest(b"IWAD"))));
        assert!(resolver.has_file(&WantedFile::new("maps.wad", "")));
        assert!(!resolver.has_file(&WantedFile::new("maps.wad", file_digest(b"PWAD"))));
        assert!(!resolver.has_file(&WantedFile::new("other.wad", "")));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_ban_list() {
        let mut bans = BanList::new();
        bans.ban(addr(1).ip(), "griefing");
        assert_eq!(
            bans.check(&addr(5)),
            Err(HandshakeError::Banned("griefing".into()))
        );
        assert!(bans.unban(&addr(1).ip()));
        assert!(bans.check(&addr(5)).is_ok());
    }

    #[test]
    fn test_password_digest() {
        assert_eq!(password_digest(""), "");
        assert_eq!(
            password_digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(session_digest().len(), 32);
    }

    #[test]
    fn test_denial_reasons() {
        assert_eq!(HandshakeError::ServerFull.to_string(), "Server is full");
        assert_eq!(
            HandshakeError::BadPassword.to_string(),
            "Server is passworded, no password specified or bad password."
        );
    }
}

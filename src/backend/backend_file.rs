use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::Mutex;

use crate::auth::SessionToken;
use crate::backend::{Result, Store, StoreError};
use crate::credentials::{valid_username, CreateUserError};
use crate::ledger::TransferError;
use crate::session::Session;
use crate::time::Timestamp;
use crate::transaction::{Amount, Transaction, TransactionId};
use crate::user::User;

mod kv;
use kv::KeyValues;

/// Plain files under a data directory:
///
/// - `users/<name>/creds.txt`: one `key: value` per line, including the
///   user's single session, if any
/// - `transactions.txt`: the log, `<id> <sender|-> <recipient> <amount>`
///
/// Every operation holds `state`, which makes each one atomic with respect to
/// the others within this process.
pub struct Backend {
    root: PathBuf,
    state: Mutex<State>,
}

struct State {
    next_id: TransactionId,
    /// token -> username for every stored session
    sessions: HashMap<SessionToken, String>,
}

#[derive(Clone)]
struct Record {
    user: User,
    session: Option<(SessionToken, Timestamp)>,
}

macro_rules! path {
    ($root: expr, $($components: expr),*) => {
        {
            let mut p = $root.clone();
            path!(@internal, p, $($components),*);
            p
        }
    };
    (@internal, $p:expr, $next:expr, $($rest: expr),*) => {
        $p.push($next);
        path!(@internal, $p, $($rest),*);
    };
    (@internal, $p:expr, $next:expr) => {
        $p.push($next);
    };
}

impl Backend {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let root = data_dir.to_path_buf();
        fs::create_dir_all(path!(root, "users"))?;

        let mut backend = Self {
            root,
            state: Mutex::new(State {
                next_id: 1,
                sessions: HashMap::new(),
            }),
        };

        let next_id = backend.read_log()?.last().map_or(1, |tx| tx.id + 1);
        let sessions = backend
            .read_users()?
            .into_iter()
            .filter_map(|record| Some((record.session?.0, record.user.username)))
            .collect::<HashMap<_, _>>();

        info!(
            "Using {}: {} live sessions, next transaction {next_id}",
            backend.root.display(),
            sessions.len(),
        );
        *backend.state.get_mut() = State { next_id, sessions };

        Ok(backend)
    }
}

impl Record {
    fn from_kv(username: &str, kv: &KeyValues) -> Result<Self> {
        let corrupt = |what: &str| StoreError::Corrupt(format!("{username}: bad {what}"));

        let user = User {
            username: username.into(),
            pwhash: kv::require(kv, "pwhash")?.into(),
            salt: kv::require(kv, "salt")?.into(),
            admin: kv::require(kv, "admin")?
                .parse::<bool>()
                .map_err(|_| corrupt("admin"))?,
            balance: kv::require(kv, "balance")?
                .parse::<Amount>()
                .map_err(|_| corrupt("balance"))?,
        };

        let session = match (kv.get("session_token"), kv.get("session_expiry")) {
            (Some(token), Some(expiry)) => Some((
                token
                    .parse::<SessionToken>()
                    .map_err(|()| corrupt("session_token"))?,
                expiry
                    .parse::<Timestamp>()
                    .map_err(|_| corrupt("session_expiry"))?,
            )),
            (None, None) => None,
            _ => return Err(corrupt("session")),
        };

        Ok(Self { user, session })
    }

    fn to_kv(&self) -> KeyValues {
        let mut kv = KeyValues::new();
        kv.insert("pwhash".into(), self.user.pwhash.clone());
        kv.insert("salt".into(), self.user.salt.clone());
        kv.insert("admin".into(), self.user.admin.to_string());
        kv.insert("balance".into(), self.user.balance.to_string());

        if let Some((token, expiry)) = &self.session {
            kv.insert("session_token".into(), token.as_str().into());
            kv.insert("session_expiry".into(), expiry.as_i64().to_string());
        }
        kv
    }
}

impl Backend {
    fn read_user(&self, username: &str) -> Result<Option<Record>> {
        if !valid_username(username) {
            return Ok(None);
        }

        let path = path!(self.root, "users", username, "creds.txt");
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                error!("open {path:?}: {e:?}");
                return Err(e.into());
            }
        };

        let kv = kv::read(file)?;
        Record::from_kv(username, &kv).map(Some)
    }

    /// Replaces creds.txt wholesale, via a rename so readers never see half a
    /// file.
    fn write_user(&self, record: &Record) -> Result<()> {
        let username = &record.user.username;
        let path = path!(self.root, "users", username, "creds.txt");
        let tmp = path!(self.root, "users", username, "creds.txt.tmp");

        let write = || -> std::io::Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            kv::write(&file, &record.to_kv())?;
            file.sync_data()?;
            fs::rename(&tmp, &path)
        };

        write().map_err(|e| {
            error!("write \"{username}\": {e:?}");
            e.into()
        })
    }

    fn read_users(&self) -> Result<Vec<Record>> {
        let path = path!(self.root, "users");
        let mut records = vec![];

        for ent in fs::read_dir(path)? {
            let fname = ent?.file_name();
            let fname = match fname.into_string() {
                Ok(x) => x,
                Err(e) => {
                    warn!("couldn't convert path into string: {e:?}");
                    continue;
                }
            };

            match self.read_user(&fname)? {
                Some(record) => records.push(record),
                None => warn!("stray entry in users: {fname:?}"),
            }
        }

        records.sort_by(|a, b| a.user.username.cmp(&b.user.username));
        Ok(records)
    }

    fn read_log(&self) -> Result<Vec<Transaction>> {
        let path = path!(self.root, "transactions.txt");
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut log = vec![];
        for line in BufReader::new(file).lines() {
            let line = line?;
            let corrupt = || StoreError::Corrupt(format!("transaction line {line:?}"));

            let [id, sender, recipient, amount] = *line.splitn(4, ' ').collect::<Vec<_>>() else {
                return Err(corrupt());
            };

            log.push(Transaction {
                id: id.parse::<TransactionId>().map_err(|_| corrupt())?,
                sender: match sender {
                    "-" => None,
                    _ => Some(sender.into()),
                },
                recipient: recipient.into(),
                amount: amount.parse::<Amount>().map_err(|_| corrupt())?,
            });
        }

        Ok(log)
    }

    /// Returns the log's length before the append, for `truncate_log`.
    fn append_log(&self, tx: &Transaction) -> Result<u64> {
        let path = path!(self.root, "transactions.txt");
        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        let len = file.metadata()?.len();

        let appended = writeln!(
            file,
            "{} {} {} {}",
            tx.id,
            tx.sender.as_deref().unwrap_or("-"),
            tx.recipient,
            tx.amount
        )
        .and_then(|()| file.sync_data());

        if let Err(e) = appended {
            error!("append tx {}: {e:?}", tx.id);
            // don't leave half a line behind
            file.set_len(len)?;
            return Err(e.into());
        }
        Ok(len)
    }

    fn truncate_log(&self, len: u64) -> std::io::Result<()> {
        let path = path!(self.root, "transactions.txt");
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_data()
    }

    /// Debit `sender` and credit `recipient`, undoing everything (the log
    /// entry ending at `log_len` included) if either write fails.
    fn apply_transfer(
        &self,
        log_len: u64,
        sender: Option<&Record>,
        recipient: &Record,
        amount: Amount,
        credited: Amount,
    ) -> Result<()> {
        let mut debited = None;
        if let Some(sender) = sender {
            let mut after = sender.clone();
            after.user.balance -= amount;
            debited = Some(after);
        }
        let mut after = recipient.clone();
        after.user.balance = credited;

        let written = match &debited {
            Some(debited) => self.write_user(debited),
            None => Ok(()),
        }
        .and_then(|()| self.write_user(&after));

        let Err(e) = written else {
            return Ok(());
        };

        warn!("rolling back transfer to {}: {e}", recipient.user.username);
        if let Err(e) = self.truncate_log(log_len) {
            error!("couldn't truncate the transaction log to {log_len}: {e:?}");
        }
        if let Some(sender) = sender {
            if let Err(e) = self.write_user(sender) {
                error!("couldn't restore \"{}\": {e}", sender.user.username);
            }
        }
        Err(e)
    }
}

#[async_trait]
impl Store for Backend {
    async fn find_user(&self, username: &str) -> Result<Option<User>> {
        let _state = self.state.lock().await;
        Ok(self.read_user(username)?.map(|record| record.user))
    }

    async fn create_user(&self, user: &User) -> Result<(), CreateUserError> {
        let _state = self.state.lock().await;
        let username = &user.username;

        if !valid_username(username) {
            return Err(CreateUserError::InvalidUsername);
        }

        match fs::create_dir(path!(self.root, "users", username)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(CreateUserError::AlreadyExists);
            }
            Err(e) => return Err(StoreError::from(e).into()),
        }

        self.write_user(&Record {
            user: user.clone(),
            session: None,
        })?;
        Ok(())
    }

    async fn set_admin(&self, username: &str) -> Result<()> {
        let _state = self.state.lock().await;

        match self.read_user(username)? {
            Some(mut record) if !record.user.admin => {
                record.user.admin = true;
                self.write_user(&record)
            }
            _ => Ok(()),
        }
    }

    async fn users(&self) -> Result<Vec<User>> {
        let _state = self.state.lock().await;
        Ok(self
            .read_users()?
            .into_iter()
            .map(|record| record.user)
            .collect())
    }

    async fn transfer(
        &self,
        from: Option<&str>,
        to: &str,
        amount: Amount,
    ) -> Result<TransactionId, TransferError> {
        let mut state = self.state.lock().await;

        let recipient = self.read_user(to)?.ok_or(TransferError::UnknownUser)?;
        let sender = match from {
            Some(from) => Some(self.read_user(from)?.ok_or(TransferError::UnknownUser)?),
            None => None,
        };

        if let Some(sender) = &sender {
            if sender.user.balance < amount {
                return Err(TransferError::InsufficientBalance);
            }
        }

        // paying yourself leaves the balance alone but is still logged
        let self_transfer = from == Some(to);
        let credited = if self_transfer {
            recipient.user.balance
        } else {
            recipient
                .user
                .balance
                .checked_add(amount)
                .ok_or(TransferError::BalanceOverflow)?
        };

        let tx = Transaction {
            id: state.next_id,
            sender: from.map(Into::into),
            recipient: to.into(),
            amount,
        };
        let log_len = self.append_log(&tx)?;
        if !self_transfer {
            self.apply_transfer(log_len, sender.as_ref(), &recipient, amount, credited)?;
        }
        state.next_id += 1;

        Ok(tx.id)
    }

    async fn transactions(&self, username: Option<&str>) -> Result<Vec<Transaction>> {
        let _state = self.state.lock().await;
        let mut log = self.read_log()?;

        if let Some(username) = username {
            log.retain(|tx| tx.recipient == username || tx.sender.as_deref() == Some(username));
        }
        Ok(log)
    }

    async fn replace_session(&self, session: &Session) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut record = self
            .read_user(&session.username)?
            .ok_or_else(|| StoreError::UnknownUser(session.username.clone()))?;

        let old = record
            .session
            .replace((session.token.clone(), session.expiry));
        self.write_user(&record)?;

        if let Some((old, _)) = old {
            state.sessions.remove(&old);
        }
        state
            .sessions
            .insert(session.token.clone(), session.username.clone());
        Ok(())
    }

    async fn find_session(&self, token: &SessionToken) -> Result<Option<Session>> {
        let state = self.state.lock().await;

        let Some(username) = state.sessions.get(token) else {
            return Ok(None);
        };

        let session = self
            .read_user(username)?
            .and_then(|record| record.session)
            .filter(|(stored, _)| stored == token)
            .map(|(token, expiry)| Session {
                token,
                username: username.clone(),
                expiry,
            });
        Ok(session)
    }

    async fn delete_session(&self, token: &SessionToken) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(username) = state.sessions.remove(token) else {
            return Ok(());
        };

        if let Some(mut record) = self.read_user(&username)? {
            if matches!(&record.session, Some((stored, _)) if stored == token) {
                record.session = None;
                self.write_user(&record)?;
            }
        }
        Ok(())
    }

    async fn delete_user_sessions(&self, username: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(mut record) = self.read_user(username)? {
            if let Some((token, _)) = record.session.take() {
                self.write_user(&record)?;
                state.sessions.remove(&token);
            }
        }
        Ok(())
    }

    async fn delete_expired_sessions(&self, now: Timestamp) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut count = 0;

        let usernames: Vec<String> = state.sessions.values().cloned().collect();
        for username in usernames {
            let Some(mut record) = self.read_user(&username)? else {
                continue;
            };

            if let Some((token, expiry)) = record.session.clone() {
                if expiry < now {
                    record.session = None;
                    self.write_user(&record)?;
                    state.sessions.remove(&token);
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::auth::hash_password;

    fn user(name: &str) -> User {
        User::new(name.into(), hash_password("pw", "salt"), "salt".into())
    }

    #[tokio::test]
    async fn state_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session {
            token: SessionToken::new(),
            username: "alice".into(),
            expiry: Timestamp::from_i64(99),
        };

        {
            let backend = Backend::new(dir.path()).await.unwrap();
            backend.create_user(&user("alice")).await.unwrap();
            backend.create_user(&user("bob")).await.unwrap();
            backend.set_admin("bob").await.unwrap();
            backend.transfer(None, "alice", 10).await.unwrap();
            backend.transfer(Some("alice"), "bob", 4).await.unwrap();
            backend.replace_session(&session).await.unwrap();
        }

        let backend = Backend::new(dir.path()).await.unwrap();
        let alice = backend.find_user("alice").await.unwrap().unwrap();
        let bob = backend.find_user("bob").await.unwrap().unwrap();
        assert_eq!((alice.balance, alice.admin), (6, false));
        assert_eq!((bob.balance, bob.admin), (4, true));

        assert_eq!(backend.find_session(&session.token).await.unwrap(), Some(session));
        // ids carry on from the existing log
        assert_eq!(backend.transfer(None, "bob", 1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn on_disk_layout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(dir.path()).await.unwrap();

        backend.create_user(&user("alice")).await.unwrap();
        backend.create_user(&user("bob")).await.unwrap();
        backend.transfer(None, "alice", 10).await.unwrap();
        backend.transfer(Some("alice"), "bob", 3).await.unwrap();

        let log = fs::read_to_string(dir.path().join("transactions.txt")).unwrap();
        assert_eq!(log, "1 - alice 10\n2 alice bob 3\n");

        let creds = fs::read_to_string(dir.path().join("users/alice/creds.txt")).unwrap();
        assert!(creds.contains("balance: 7\n"));
        assert!(creds.contains("admin: false\n"));
        assert!(!creds.contains("session"));
    }

    async fn balances(backend: &Backend) -> (Amount, Amount) {
        (
            backend.find_user("alice").await.unwrap().unwrap().balance,
            backend.find_user("bob").await.unwrap().unwrap().balance,
        )
    }

    #[tokio::test]
    async fn failed_writes_roll_transfers_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(dir.path()).await.unwrap();
        backend.create_user(&user("alice")).await.unwrap();
        backend.create_user(&user("bob")).await.unwrap();
        backend.transfer(None, "alice", 10).await.unwrap();

        // a directory where a replacement record would be written
        for blocked in ["bob", "alice"] {
            let blocker = dir.path().join("users").join(blocked).join("creds.txt.tmp");
            fs::create_dir(&blocker).unwrap();

            assert!(matches!(
                backend.transfer(Some("alice"), "bob", 4).await,
                Err(TransferError::Store(_))
            ));
            assert_eq!(balances(&backend).await, (10, 0));
            assert_eq!(backend.transactions(None).await.unwrap().len(), 1);

            fs::remove_dir(&blocker).unwrap();
        }

        assert_eq!(backend.transfer(Some("alice"), "bob", 4).await.unwrap(), 2);
        assert_eq!(balances(&backend).await, (6, 4));

        let log = fs::read_to_string(dir.path().join("transactions.txt")).unwrap();
        assert_eq!(log, "1 - alice 10\n2 alice bob 4\n");
        assert!(crate::ledger::Ledger::new(&backend).audit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn audit_reports_tampered_balances() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(dir.path()).await.unwrap();
        backend.create_user(&user("alice")).await.unwrap();
        backend.transfer(None, "alice", 10).await.unwrap();

        let creds = dir.path().join("users/alice/creds.txt");
        let tampered = fs::read_to_string(&creds)
            .unwrap()
            .replace("balance: 10", "balance: 50");
        fs::write(&creds, tampered).unwrap();

        let coin = crate::coin::TmsaCoin::new(std::sync::Arc::new(backend), 60);
        assert_eq!(
            coin.audit().await.unwrap(),
            [crate::ledger::Mismatch {
                username: "alice".into(),
                cached: 50,
                logged: 10,
            }]
        );
    }

    #[tokio::test]
    async fn odd_usernames_never_touch_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(dir.path()).await.unwrap();

        assert!(backend.find_user("..").await.unwrap().is_none());
        assert!(backend.find_user("../users").await.unwrap().is_none());
        assert!(matches!(
            backend.create_user(&user("../evil")).await,
            Err(CreateUserError::InvalidUsername)
        ));
        assert!(matches!(
            backend.transfer(None, "../evil", 1).await,
            Err(TransferError::UnknownUser)
        ));
    }

    #[tokio::test]
    async fn corrupt_records_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(dir.path()).await.unwrap();
        backend.create_user(&user("alice")).await.unwrap();

        fs::write(dir.path().join("users/alice/creds.txt"), "pwhash: x\n").unwrap();
        assert!(matches!(
            backend.find_user("alice").await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn sessions_for_unknown_users_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::new(dir.path()).await.unwrap();

        let session = Session {
            token: SessionToken::new(),
            username: "ghost".into(),
            expiry: Timestamp::from_i64(1),
        };
        assert!(matches!(
            backend.replace_session(&session).await,
            Err(StoreError::UnknownUser(_))
        ));
    }
}

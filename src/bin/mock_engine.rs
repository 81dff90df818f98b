//! Mock Spaceway engine for integration testing
//!
//! Reads the engine's line commands on stdin and writes the same log lines
//! the real engine does. Instances started in the same run directory share
//! an append-only event file in place of a network, which is enough to model
//! membership, channel-scoped removal and key rotation as seen from the logs.
//!
//! Members of a space's encrypted group log `Decrypted MLS message` for every
//! channel, thread and message event they can read; removed members log a
//! decrypt failure instead and never see the plaintext.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::hash::{BuildHasher, Hasher};
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde::{Deserialize, Serialize};

const BUS_POLL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "mock_engine", about = "Stand-in Spaceway engine for tests")]
struct Args {
    /// Credential file; created with a fresh identity if missing
    #[arg(long)]
    account: PathBuf,

    /// Listen port (reported, not bound)
    #[arg(long)]
    port: u16,

    /// Shared event file (default: <account dir>/bus/events.jsonl)
    #[arg(long)]
    bus: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event {
    KeyPackage {
        user: String,
    },
    SpaceCreated {
        space: String,
        name: String,
        owner: String,
        mls: bool,
    },
    InviteCreated {
        space: String,
        code: String,
    },
    Joined {
        space: String,
        user: String,
    },
    MemberAdded {
        space: String,
        user: String,
    },
    Kicked {
        space: String,
        channel: Option<String>,
        user: String,
    },
    ChannelCreated {
        space: String,
        channel: String,
        name: String,
    },
    ThreadCreated {
        space: String,
        channel: String,
        thread: String,
        title: String,
    },
    Message {
        space: String,
        channel: String,
        thread: String,
        text: String,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    from: String,
    #[serde(flatten)]
    event: Event,
}

#[derive(Default)]
struct Space {
    name: String,
    owner: String,
    mls: bool,
    epoch: u64,
    members: HashSet<String>,
    joined: HashSet<String>,
    invites: HashSet<String>,
    /// (id, name)
    channels: Vec<(String, String)>,
    /// (channel id, thread id, title)
    threads: Vec<(String, String, String)>,
    /// (channel id, user)
    removed: HashSet<(String, String)>,
}

struct Node {
    user: String,
    peer: String,
    port: u16,
    bus: PathBuf,
    offset: u64,
    spaces: HashMap<String, Space>,
    order: Vec<String>,
    keypackages: HashSet<String>,
    space: Option<String>,
    channel: Option<String>,
    thread: Option<String>,
}

fn random_hex(len: usize) -> String {
    let state = RandomState::new();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut out = String::with_capacity(len + 16);
    let mut counter = 0u64;
    while out.len() < len {
        let mut hasher = state.build_hasher();
        hasher.write_u64(counter);
        hasher.write_u128(nanos);
        hasher.write_u32(std::process::id());
        out.push_str(&format!("{:016x}", hasher.finish()));
        counter += 1;
    }
    out.truncate(len);
    out
}

fn short(id: &str) -> &str {
    &id[..id.len().min(16)]
}

fn load_identity(account: &Path) -> io::Result<String> {
    if let Ok(content) = std::fs::read_to_string(account) {
        let id = content.trim();
        if id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(id.to_string());
        }
    }
    let id = random_hex(64);
    std::fs::write(account, format!("{id}\n"))?;
    Ok(id)
}

impl Node {
    /// Read events appended since the last sync
    fn sync(&mut self) {
        let Ok(mut file) = std::fs::File::open(&self.bus) else {
            return;
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return;
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return;
        }
        // Only consume complete lines; a writer may be mid-append
        let Some(end) = buf.rfind('\n') else {
            return;
        };
        self.offset += (end + 1) as u64;
        for line in buf[..end].lines() {
            match serde_json::from_str::<Envelope>(line) {
                Ok(env) if env.from != self.user => self.apply(&env.from, env.event, false),
                Ok(_) => {}
                Err(e) => eprintln!("WARN bus: skipping malformed event: {e}"),
            }
        }
    }

    /// Apply locally and publish to the other instances
    fn emit(&mut self, event: Event) {
        let env = Envelope {
            from: self.user.clone(),
            event: event.clone(),
        };
        self.apply(&self.user.clone(), event, true);
        let written = serde_json::to_string(&env)
            .map_err(io::Error::from)
            .and_then(|line| {
                let mut file = OpenOptions::new().create(true).append(true).open(&self.bus)?;
                file.write_all(format!("{line}\n").as_bytes())
            });
        if let Err(e) = written {
            eprintln!("ERROR bus: {e}");
        }
    }

    fn can_read(&self, space: &str, channel: Option<&str>) -> bool {
        let Some(s) = self.spaces.get(space) else {
            return false;
        };
        let in_group = if s.mls {
            s.members.contains(&self.user)
        } else {
            s.owner == self.user || s.joined.contains(&self.user)
        };
        in_group
            && channel.map_or(true, |c| {
                !s.removed.contains(&(c.to_string(), self.user.clone()))
            })
    }

    fn decrypted(&self, space: &str, channel: Option<&str>) -> bool {
        if self.can_read(space, channel) {
            println!("Decrypted MLS message");
            true
        } else {
            println!("✗ Failed to decrypt MLS message: not in current epoch");
            false
        }
    }

    fn apply(&mut self, from: &str, event: Event, local: bool) {
        let me = self.user.clone();
        match event {
            Event::KeyPackage { user } => {
                self.keypackages.insert(user);
            }
            Event::SpaceCreated {
                space,
                name,
                owner,
                mls,
            } => {
                if !self.spaces.contains_key(&space) {
                    self.order.push(space.clone());
                }
                let entry = self.spaces.entry(space).or_default();
                entry.name = name;
                entry.members.insert(owner.clone());
                entry.owner = owner;
                entry.mls = mls;
            }
            Event::InviteCreated { space, code } => {
                self.spaces.entry(space).or_default().invites.insert(code);
            }
            Event::Joined { space, user } => {
                self.spaces.entry(space).or_default().joined.insert(user);
            }
            Event::MemberAdded { space, user } => {
                let s = self.spaces.entry(space).or_default();
                s.members.insert(user.clone());
                s.epoch += 1;
                if user == me && !local {
                    println!("✓ Received MLS Welcome for space: {}", s.name);
                }
            }
            Event::Kicked {
                space,
                channel,
                user,
            } => {
                let s = self.spaces.entry(space).or_default();
                s.epoch += 1;
                match channel {
                    Some(channel) => {
                        if user == me {
                            let name = s
                                .channels
                                .iter()
                                .find(|(id, _)| *id == channel)
                                .map(|(_, n)| n.clone())
                                .unwrap_or_else(|| short(&channel).to_string());
                            println!("⚠ You were removed from channel {name}");
                        }
                        s.removed.insert((channel, user));
                    }
                    None => {
                        s.members.remove(&user);
                        s.joined.remove(&user);
                        if user == me {
                            println!("⚠ You were removed from space {}", s.name);
                        }
                    }
                }
            }
            Event::ChannelCreated {
                space,
                channel,
                name,
            } => {
                if local || self.decrypted(&space, None) {
                    if !local {
                        println!("  New channel: {} ({})", name, short(&channel));
                    }
                    self.spaces
                        .entry(space)
                        .or_default()
                        .channels
                        .push((channel, name));
                }
            }
            Event::ThreadCreated {
                space,
                channel,
                thread,
                title,
            } => {
                if local || self.decrypted(&space, Some(channel.as_str())) {
                    if !local {
                        println!("  New thread: \"{}\" ({})", title, short(&thread));
                    }
                    self.spaces
                        .entry(space)
                        .or_default()
                        .threads
                        .push((channel, thread, title));
                }
            }
            Event::Message {
                space,
                channel,
                text,
                ..
            } => {
                if !local && self.decrypted(&space, Some(channel.as_str())) {
                    println!("  [{}] {}", &from[..from.len().min(8)], text);
                }
            }
        }
    }

    fn current_space(&self) -> Option<(&String, &Space)> {
        let id = self.space.as_ref()?;
        self.spaces.get(id).map(|s| (id, s))
    }

    fn command(&mut self, line: &str) -> bool {
        let line = line.trim();
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match (head, rest) {
            ("", _) => {}
            ("quit" | "exit", _) => return false,
            ("keypackage", "publish") => {
                let user = self.user.clone();
                self.emit(Event::KeyPackage { user });
                println!("✓ Published KeyPackage");
            }
            ("whoami", _) => println!("User ID: {}", self.user),
            ("network", _) => {
                println!("Network Info:");
                println!("  Peer ID: {}", self.peer);
                println!("  Listening on: /ip4/127.0.0.1/tcp/{}", self.port);
            }
            ("connect", addr) => {
                let peer = addr.rsplit('/').next().unwrap_or(addr);
                println!("✓ Connected to {peer}");
            }
            ("space", args) => self.space_command(args),
            ("spaces", _) => {
                println!("Spaces ({}):", self.order.len());
                for id in &self.order {
                    let marker = if self.space.as_deref() == Some(id.as_str()) { "→" } else { " " };
                    if let Some(s) = self.spaces.get(id) {
                        println!("  {} {} - {}", marker, short(id), s.name);
                    }
                }
            }
            ("context", _) => {
                println!("Current Context:");
                match self.current_space() {
                    Some((id, s)) => {
                        println!("  Space: {id}");
                        println!("  Name: {}", s.name);
                    }
                    None => println!("  Space: (none)"),
                }
                if let Some(channel) = &self.channel {
                    println!("  Channel: {}", short(channel));
                }
                if let Some(thread) = &self.thread {
                    println!("  Thread: {}", short(thread));
                }
            }
            ("invite", "create") => match self.space.clone() {
                Some(space) => {
                    let code = random_hex(8);
                    self.emit(Event::InviteCreated {
                        space,
                        code: code.clone(),
                    });
                    println!("✓ Created invite code: {code}");
                }
                None => println!("Error: No space selected"),
            },
            ("join", args) => self.join(args),
            ("member", args) => match args.split_once(' ') {
                Some(("add", user)) => self.add_member(user.trim()),
                _ => println!("Usage: member add <user-id>"),
            },
            ("kick", user) => self.kick(user),
            ("channel", args) => self.channel_command(args),
            ("channels", _) => self.list_channels(),
            ("thread", args) => self.thread_command(args),
            ("threads", _) => self.list_threads(),
            ("send", text) => self.send(text),
            _ => println!("Unknown command: {line}"),
        }
        true
    }

    fn space_command(&mut self, args: &str) {
        if let Some(rest) = args.strip_prefix("create") {
            let mut tokens = rest.split_whitespace();
            let Some(name) = tokens.next() else {
                println!("Usage: space create <name> [--mode mls|lightweight]");
                return;
            };
            let mls = match (tokens.next(), tokens.next()) {
                (Some("--mode"), Some("lightweight")) => false,
                (Some("--mode"), Some("mls")) | (None, _) => true,
                _ => {
                    println!("Error: Unknown mode, expected mls or lightweight");
                    return;
                }
            };
            let space = random_hex(64);
            self.emit(Event::SpaceCreated {
                space: space.clone(),
                name: name.to_string(),
                owner: self.user.clone(),
                mls,
            });
            println!("✓ Created space: {} ({})", name, short(&space));
            if mls {
                println!("  Created MLS-encrypted space (space-level encryption enabled)");
            } else {
                println!("  Created LIGHTWEIGHT space (no space-level MLS group)");
            }
            self.space = Some(space);
            self.channel = None;
            self.thread = None;
            return;
        }
        let wanted = args.trim();
        let found = self
            .order
            .iter()
            .find(|id| !wanted.is_empty() && id.starts_with(wanted))
            .cloned();
        match found {
            Some(id) => {
                let name = self.spaces.get(&id).map(|s| s.name.clone()).unwrap_or_default();
                println!("✓ Switched to space: {name}");
                self.space = Some(id);
                self.channel = None;
                self.thread = None;
            }
            None => println!("Error: Space not found: {wanted}"),
        }
    }

    fn join(&mut self, args: &str) {
        let mut tokens = args.split_whitespace();
        let (Some(space), Some(code)) = (tokens.next(), tokens.next()) else {
            println!("Usage: join <space-id> <invite-code>");
            return;
        };
        let valid = self
            .spaces
            .get(space)
            .is_some_and(|s| s.invites.contains(code));
        if !valid {
            println!("Error: Invalid invite code for space {}", short(space));
            return;
        }
        let user = self.user.clone();
        self.emit(Event::Joined {
            space: space.to_string(),
            user,
        });
        let name = self.spaces.get(space).map(|s| s.name.clone()).unwrap_or_default();
        println!("✓ Joined space: {} ({})", name, short(space));
        self.space = Some(space.to_string());
        self.channel = None;
        self.thread = None;
    }

    /// Owner check shared by membership and channel administration
    fn admin_space(&self, action: &str) -> Option<String> {
        let Some((id, s)) = self.current_space() else {
            println!("Error: No space selected");
            return None;
        };
        if s.owner != self.user {
            println!("✗ Permission denied: only space admins can {action}");
            return None;
        }
        Some(id.clone())
    }

    fn add_member(&mut self, user: &str) {
        let Some(space) = self.admin_space("add members") else {
            return;
        };
        let joined = self.spaces.get(&space).is_some_and(|s| s.joined.contains(user));
        if !joined {
            println!("Error: User {} has not joined this space", short(user));
            return;
        }
        if !self.keypackages.contains(user) {
            println!("Error: No KeyPackage found for {}", short(user));
            return;
        }
        self.emit(Event::MemberAdded {
            space: space.clone(),
            user: user.to_string(),
        });
        let epoch = self.spaces.get(&space).map_or(0, |s| s.epoch);
        println!("✓ Added {} to MLS group (epoch {})", short(user), epoch);
    }

    fn kick(&mut self, user: &str) {
        let Some(space) = self.admin_space("kick members") else {
            return;
        };
        let channel = self.channel.clone();
        self.emit(Event::Kicked {
            space: space.clone(),
            channel: channel.clone(),
            user: user.to_string(),
        });
        match channel {
            Some(channel) => println!(
                "✓ Successfully removed user {} from channel {}",
                short(user),
                short(&channel)
            ),
            None => println!("✓ Successfully removed user {} from space", short(user)),
        }
        let epoch = self.spaces.get(&space).map_or(0, |s| s.epoch);
        println!("  MLS keys rotated (epoch {epoch}), removed member can't decrypt new messages");
    }

    fn channel_command(&mut self, args: &str) {
        if let Some(name) = args.strip_prefix("create") {
            let name = name.trim();
            if name.is_empty() {
                println!("Usage: channel create <name>");
                return;
            }
            let Some(space) = self.admin_space("create channels") else {
                return;
            };
            let channel = random_hex(16);
            self.emit(Event::ChannelCreated {
                space,
                channel: channel.clone(),
                name: name.to_string(),
            });
            println!("✓ Created channel: {} ({})", name, channel);
            self.channel = Some(channel);
            self.thread = None;
            return;
        }
        let wanted = args.trim();
        let found = self.current_space().and_then(|(_, s)| {
            s.channels
                .iter()
                .find(|(id, _)| !wanted.is_empty() && id.starts_with(wanted))
                .cloned()
        });
        match found {
            Some((id, name)) => {
                println!("✓ Switched to channel: {name}");
                self.channel = Some(id);
                self.thread = None;
            }
            None => println!("Error: Channel not found: {wanted}"),
        }
    }

    fn list_channels(&self) {
        let Some((_, s)) = self.current_space() else {
            println!("Error: No space selected");
            return;
        };
        println!("Channels ({}):", s.channels.len());
        for (id, name) in &s.channels {
            let marker = if self.channel.as_deref() == Some(id.as_str()) { "→" } else { " " };
            println!("  {marker} {id} - {name}");
        }
    }

    fn thread_command(&mut self, args: &str) {
        if let Some(title) = args.strip_prefix("create") {
            let title = title.trim().trim_matches('"');
            let (Some(space), Some(channel)) = (self.space.clone(), self.channel.clone()) else {
                println!("Error: No channel selected");
                return;
            };
            if title.is_empty() {
                println!("Usage: thread create \"<title>\"");
                return;
            }
            let thread = random_hex(16);
            self.emit(Event::ThreadCreated {
                space,
                channel,
                thread: thread.clone(),
                title: title.to_string(),
            });
            println!("✓ Created thread: {} ({})", title, thread);
            self.thread = Some(thread);
            return;
        }
        let wanted = args.trim();
        let channel = self.channel.clone();
        let found = self.current_space().and_then(|(_, s)| {
            s.threads
                .iter()
                .find(|(c, id, _)| {
                    Some(c) == channel.as_ref() && !wanted.is_empty() && id.starts_with(wanted)
                })
                .cloned()
        });
        match found {
            Some((_, id, title)) => {
                println!("✓ Switched to thread: \"{title}\"");
                self.thread = Some(id);
            }
            None => println!("Error: Thread not found: {wanted}"),
        }
    }

    fn list_threads(&self) {
        let (Some((_, s)), Some(channel)) = (self.current_space(), self.channel.as_ref()) else {
            println!("Error: No channel selected");
            return;
        };
        let threads: Vec<_> = s.threads.iter().filter(|(c, _, _)| c == channel).collect();
        println!("Threads ({}):", threads.len());
        for (_, id, title) in threads {
            let marker = if self.thread.as_deref() == Some(id.as_str()) { "→" } else { " " };
            println!("  {marker} {id} - \"{title}\"");
        }
    }

    fn send(&mut self, text: &str) {
        let (Some(space), Some(channel), Some(thread)) =
            (self.space.clone(), self.channel.clone(), self.thread.clone())
        else {
            println!("Error: No thread selected");
            return;
        };
        if text.is_empty() {
            println!("Usage: send <text>");
            return;
        }
        if !self.can_read(&space, Some(channel.as_str())) {
            println!("Error: Not a member of this channel's encryption group");
            return;
        }
        self.emit(Event::Message {
            space,
            channel,
            thread,
            text: text.to_string(),
        });
        println!("✓ Message sent");
    }
}

fn lock(node: &Mutex<Node>) -> MutexGuard<'_, Node> {
    // A panic while printing leaves the state usable
    node.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    let user = load_identity(&args.account)?;
    let bus = match args.bus {
        Some(bus) => bus,
        None => args
            .account
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("bus")
            .join("events.jsonl"),
    };
    if let Some(dir) = bus.parent() {
        std::fs::create_dir_all(dir)?;
    }

    println!("Spaceway mock engine");
    println!("  Account: {}", args.account.display());
    println!("  Listening on /ip4/127.0.0.1/tcp/{}", args.port);

    let node = Arc::new(Mutex::new(Node {
        peer: format!("12D3KooW{}", &user[..32]),
        user,
        port: args.port,
        bus,
        offset: 0,
        spaces: HashMap::new(),
        order: Vec::new(),
        keypackages: HashSet::new(),
        space: None,
        channel: None,
        thread: None,
    }));
    lock(&node).sync();

    let poller = Arc::clone(&node);
    std::thread::spawn(move || loop {
        std::thread::sleep(BUS_POLL);
        lock(&poller).sync();
    });

    for line in io::stdin().lock().lines() {
        let line = line?;
        let mut node = lock(&node);
        node.sync();
        if !node.command(&line) {
            break;
        }
    }
    println!("Shutting down");
    Ok(())
}

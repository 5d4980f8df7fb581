//! Line-oriented control protocol for music-player clients.
//!
//! One task per connection. Every command answers with `key: value` lines and
//! `OK`, or a single `ACK [code@index] {command} message` line.
//!
//! Playlist replacement maps onto transitions: `clear` while playback is active
//! starts one, following adds fill the pending playlist, `play` completes it
//! and `stop` cancels it.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, Subsystem};
use crate::player::{PlaybackState, Player, PlayerError};
use crate::playlist::{ChangeOp, META_DURATION, META_TITLE, Playlist, PlaylistError, Track};

pub const PROTOCOL_VERSION: &str = "0.23.0";

const COMMANDS: &[&str] = &[
    "add",
    "addid",
    "clear",
    "close",
    "command_list_begin",
    "command_list_end",
    "command_list_ok_begin",
    "commands",
    "currentsong",
    "idle",
    "next",
    "noidle",
    "outputs",
    "pause",
    "ping",
    "play",
    "playlistinfo",
    "plchanges",
    "previous",
    "random",
    "repeat",
    "seekcur",
    "status",
    "stop",
    "tagtypes",
];

const TAG_TYPES: &[(&str, &str)] = &[("Artist", "artist"), ("Album", "album"), ("Title", META_TITLE)];

/// Error codes of the `ACK` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Arg = 2,
    Unknown = 5,
    NoExist = 50,
    System = 52,
    PlayerSync = 55,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub code: AckCode,
    pub command: String,
    pub message: String,
}

impl Ack {
    pub fn new(code: AckCode, command: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            command: command.to_string(),
            message: message.into(),
        }
    }

    fn render(&self, index: usize) -> String {
        format!(
            "ACK [{}@{}] {{{}}} {}\n",
            self.code as u8, index, self.command, self.message
        )
    }

    fn from_player(command: &str, err: PlayerError) -> Self {
        let code = match &err {
            PlayerError::Playlist(PlaylistError::OutOfBounds { .. }) => AckCode::Arg,
            PlayerError::Playlist(_) | PlayerError::NoTransition => AckCode::NoExist,
            PlayerError::NoBackend
            | PlayerError::NotPlaying
            | PlayerError::NotPaused
            | PlayerError::NotStopped => AckCode::PlayerSync,
            _ => AckCode::System,
        };
        Self::new(code, command, err.to_string())
    }
}

/// Split a command line into arguments. Double quotes group, backslash escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut chars = line.trim().chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };
        let mut arg = String::new();
        if first == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => arg.push(escaped),
                        None => break,
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => arg.push(c),
                }
            }
            if !closed {
                return Err("Missing closing '\"'".to_string());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                arg.push(c);
                chars.next();
            }
        }
        args.push(arg);
    }
    Ok(args)
}

fn arg<'a>(args: &'a [String], index: usize, command: &str) -> Result<&'a str, Ack> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| Ack::new(AckCode::Arg, command, "missing argument"))
}

fn parse_arg<T: std::str::FromStr>(value: &str, command: &str) -> Result<T, Ack> {
    value
        .parse()
        .map_err(|_| Ack::new(AckCode::Arg, command, format!("invalid argument \"{value}\"")))
}

fn parse_flag(value: &str, command: &str) -> Result<bool, Ack> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(Ack::new(AckCode::Arg, command, format!("boolean (0/1) expected: {value}"))),
    }
}

fn write_track(out: &mut String, track: &Track, position: usize) {
    let _ = writeln!(out, "file: {}", track.url);
    for (tag, key) in TAG_TYPES {
        if let Some(value) = track.metadata.get(*key) {
            let _ = writeln!(out, "{tag}: {value}");
        }
    }
    if let Some(secs) = track.duration() {
        let _ = writeln!(out, "Time: {}", secs.round() as u64);
        let _ = writeln!(out, "{META_DURATION}: {secs:.3}");
    }
    let _ = writeln!(out, "Pos: {position}");
    let _ = writeln!(out, "Id: {position}");
}

struct CommandList {
    ok_mode: bool,
    commands: Vec<Vec<String>>,
}

/// Shared context for all connections.
pub struct Frontend {
    player: Player,
    events: EventBus,
    output_name: String,
}

impl Frontend {
    pub fn new(player: Player, events: EventBus, output_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            player,
            events,
            output_name: output_name.into(),
        })
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            stream.set_nodelay(true).ok();
            tracing::debug!(%peer, "client connected");
            let frontend = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = frontend.handle_connection(stream, shutdown).await {
                    tracing::debug!(%peer, error = %e, "client connection error");
                }
                tracing::debug!(%peer, "client disconnected");
            });
        }
    }

    pub async fn handle_connection<S>(
        self: Arc<Self>,
        stream: S,
        shutdown: CancellationToken,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut events = self.events.subscribe();
        writer
            .write_all(format!("OK MPD {PROTOCOL_VERSION}\n").as_bytes())
            .await?;

        let mut batch: Option<CommandList> = None;
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            let args = match tokenize(&line) {
                Ok(args) => args,
                Err(message) => {
                    let ack = Ack::new(AckCode::Arg, "", message);
                    writer.write_all(ack.render(0).as_bytes()).await?;
                    continue;
                }
            };
            let Some(name) = args.first().cloned() else {
                continue;
            };

            if name == "command_list_end" {
                let out = match batch.take() {
                    Some(list) => self.run_list(list).await,
                    None => Ack::new(AckCode::Arg, &name, "not in command list").render(0),
                };
                writer.write_all(out.as_bytes()).await?;
                continue;
            }
            if let Some(list) = batch.as_mut() {
                list.commands.push(args);
                continue;
            }

            match name.as_str() {
                "close" => break,
                "noidle" => {}
                "command_list_begin" | "command_list_ok_begin" => {
                    batch = Some(CommandList {
                        ok_mode: name == "command_list_ok_begin",
                        commands: Vec::new(),
                    });
                }
                "idle" => {
                    let open = self
                        .idle(&args[1..], &mut events, &mut lines, &mut writer, &shutdown)
                        .await?;
                    if !open {
                        break;
                    }
                }
                _ => {
                    let out = match self.execute(&args).await {
                        Ok(mut body) => {
                            body.push_str("OK\n");
                            body
                        }
                        Err(ack) => ack.render(0),
                    };
                    writer.write_all(out.as_bytes()).await?;
                }
            }
        }
        writer.shutdown().await.ok();
        Ok(())
    }

    async fn run_list(&self, list: CommandList) -> String {
        let mut out = String::new();
        for (index, args) in list.commands.iter().enumerate() {
            match self.execute(args).await {
                Ok(body) => {
                    out.push_str(&body);
                    if list.ok_mode {
                        out.push_str("list_OK\n");
                    }
                }
                Err(ack) => {
                    out.push_str(&ack.render(index));
                    return out;
                }
            }
        }
        out.push_str("OK\n");
        out
    }

    /// Block until a wanted subsystem changes or the client sends `noidle`.
    /// Returns false when the connection should close.
    async fn idle<R, W>(
        &self,
        filter: &[String],
        events: &mut broadcast::Receiver<Subsystem>,
        lines: &mut Lines<R>,
        writer: &mut W,
        shutdown: &CancellationToken,
    ) -> io::Result<bool>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut wanted = BTreeSet::new();
        for name in filter {
            match Subsystem::from_name(name) {
                Some(subsystem) => {
                    wanted.insert(subsystem.name());
                }
                None => {
                    let ack = Ack::new(AckCode::Arg, "idle", format!("Unrecognized idle event: {name}"));
                    writer.write_all(ack.render(0).as_bytes()).await?;
                    return Ok(true);
                }
            }
        }
        if wanted.is_empty() {
            wanted.extend([Subsystem::Player.name(), Subsystem::Playlist.name()]);
        }

        let mut changed = BTreeSet::new();
        loop {
            match events.try_recv() {
                Ok(subsystem) => {
                    if wanted.contains(subsystem.name()) {
                        changed.insert(subsystem.name());
                    }
                }
                Err(TryRecvError::Lagged(_)) => changed.extend(wanted.iter().copied()),
                Err(_) => break,
            }
        }

        while changed.is_empty() {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(subsystem) => {
                        if wanted.contains(subsystem.name()) {
                            changed.insert(subsystem.name());
                        }
                    }
                    Err(RecvError::Lagged(_)) => changed.extend(wanted.iter().copied()),
                    Err(RecvError::Closed) => return Ok(false),
                },
                line = lines.next_line() => match line? {
                    Some(line) if line.trim() == "noidle" => break,
                    Some(line) => {
                        tracing::debug!(line, "command while idle; closing connection");
                        return Ok(false);
                    }
                    None => return Ok(false),
                },
                _ = shutdown.cancelled() => return Ok(false),
            }
        }

        let mut out = String::new();
        for name in changed {
            let _ = writeln!(out, "changed: {name}");
        }
        out.push_str("OK\n");
        writer.write_all(out.as_bytes()).await?;
        Ok(true)
    }

    /// The playlist clients see: the pending one while a transition is open.
    fn visible_playlist(&self) -> Arc<Playlist> {
        self.player
            .pending_playlist()
            .unwrap_or_else(|| self.player.get_playlist())
    }

    async fn execute(&self, args: &[String]) -> Result<String, Ack> {
        let name = args[0].as_str();
        let rest = &args[1..];
        let player_err = |e: PlayerError| Ack::from_player(name, e);
        match name {
            "ping" => Ok(String::new()),
            "commands" => Ok(COMMANDS.iter().map(|c| format!("command: {c}\n")).collect()),
            "tagtypes" => Ok(match rest.first() {
                None => TAG_TYPES.iter().map(|(tag, _)| format!("tagtype: {tag}\n")).collect(),
                Some(_) => String::new(),
            }),
            "random" | "repeat" => {
                parse_flag(arg(rest, 0, name)?, name)?;
                Ok(String::new())
            }
            "outputs" => Ok(self.outputs().await),
            "status" => Ok(self.status().await),
            "currentsong" => {
                let live = self.player.get_playlist();
                let mut out = String::new();
                if let (Some(index), Some(track)) = (live.current_index(), live.current_track()) {
                    write_track(&mut out, &track, index);
                }
                Ok(out)
            }
            "playlistinfo" => {
                let playlist = self.visible_playlist();
                let mut out = String::new();
                match rest.first() {
                    Some(pos) => {
                        let pos: usize = parse_arg(pos, name)?;
                        let track = playlist
                            .track(pos)
                            .ok_or_else(|| Ack::new(AckCode::Arg, name, "Bad song index"))?;
                        write_track(&mut out, &track, pos);
                    }
                    None => {
                        for (pos, track) in playlist.tracks().iter().enumerate() {
                            write_track(&mut out, track, pos);
                        }
                    }
                }
                Ok(out)
            }
            "plchanges" => {
                let since: u64 = parse_arg(arg(rest, 0, name)?, name)?;
                Ok(plchanges(&self.visible_playlist(), since))
            }
            "add" => {
                let url = arg(rest, 0, name)?;
                self.player.add_track(Track::new(url)).await;
                Ok(String::new())
            }
            "addid" => {
                let track = Track::new(arg(rest, 0, name)?);
                let position = match rest.get(1) {
                    Some(pos) => {
                        let pos: usize = parse_arg(pos, name)?;
                        self.player.add_track_at(track, pos).await.map_err(player_err)?
                    }
                    None => self.player.add_track(track).await,
                };
                Ok(format!("Id: {position}\n"))
            }
            "clear" => {
                if self.player.get_state() == PlaybackState::Stopped {
                    if self.player.has_pending_transition() {
                        self.player.cancel_transition().map_err(player_err)?;
                    }
                    self.player.clear().map_err(player_err)?;
                } else {
                    self.player.begin_transition();
                    self.events.publish(Subsystem::Playlist);
                }
                Ok(String::new())
            }
            "play" => {
                let position = rest
                    .first()
                    .map(|pos| parse_arg::<usize>(pos, name))
                    .transpose()?;
                if let Some(pending) = self.player.pending_playlist() {
                    if let Some(pos) = position {
                        pending.seek(pos).map_err(|e| player_err(e.into()))?;
                        pending.commit_staged().map_err(|e| player_err(e.into()))?;
                    }
                    self.player.complete_transition().await.map_err(player_err)?;
                    return Ok(String::new());
                }
                let started = match position {
                    Some(pos) => self.player.play_at(pos).await,
                    None => self.player.play().await,
                };
                started.map_err(player_err)?;
                Ok(String::new())
            }
            "pause" => {
                let pause = match rest.first() {
                    Some(flag) => parse_flag(flag, name)?,
                    None => self.player.get_state() == PlaybackState::Playing,
                };
                let toggled = if pause {
                    self.player.pause().await
                } else {
                    self.player.resume().await
                };
                toggled.map_err(player_err)?;
                Ok(String::new())
            }
            "stop" => {
                if self.player.has_pending_transition() {
                    self.player.cancel_transition().map_err(player_err)?;
                    self.events.publish(Subsystem::Playlist);
                }
                self.player.stop().await;
                Ok(String::new())
            }
            "next" => {
                self.player.next().map_err(player_err)?;
                Ok(String::new())
            }
            "previous" => {
                self.player.previous().map_err(player_err)?;
                Ok(String::new())
            }
            "seekcur" => {
                let raw = arg(rest, 0, name)?;
                let secs: f64 = parse_arg(raw, name)?;
                let sought = if raw.starts_with('+') || raw.starts_with('-') {
                    self.player.seek_relative(secs.round() as i64).await
                } else {
                    self.player.seek(secs.round() as u64).await
                };
                sought.map_err(player_err)?;
                Ok(String::new())
            }
            _ => Err(Ack::new(AckCode::Unknown, "", format!("unknown command \"{name}\""))),
        }
    }

    async fn outputs(&self) -> String {
        let mut out = format!(
            "outputid: 0\noutputname: {}\nplugin: relay\noutputenabled: {}\n",
            self.output_name,
            u8::from(self.player.has_backend())
        );
        if self.player.has_backend() {
            match self.player.backend_tags().await {
                Ok(tags) => {
                    for tag in tags {
                        let _ = writeln!(out, "attribute: {tag}");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "host tags unavailable"),
            }
        }
        out
    }

    async fn status(&self) -> String {
        let state = self.player.get_state();
        let playlist = self.visible_playlist();
        let mut out = String::new();
        out.push_str("repeat: 0\nrandom: 0\nsingle: 0\nconsume: 0\n");
        let _ = writeln!(out, "playlist: {}", playlist.version());
        let _ = writeln!(out, "playlistlength: {}", playlist.len());
        let _ = writeln!(out, "state: {}", state.as_str());

        if state == PlaybackState::Stopped {
            return out;
        }
        if !self.player.has_pending_transition() {
            let live = self.player.get_playlist();
            if let Some(index) = live.current_index() {
                let _ = writeln!(out, "song: {index}\nsongid: {index}");
                let next = live
                    .staged_index()
                    .or_else(|| (index + 1 < live.len()).then_some(index + 1));
                if let Some(next) = next {
                    let _ = writeln!(out, "nextsong: {next}\nnextsongid: {next}");
                }
            }
        }
        let timing = match self.player.get_playback_timing().await {
            Ok(timing) => timing,
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    last_remaining = ?self.player.last_remaining(),
                    "timing query failed; answering from last known timing"
                );
                self.player.cached_timing()
            }
        };
        if let Some(timing) = timing {
            let _ = writeln!(
                out,
                "time: {}:{}",
                timing.elapsed.round() as u64,
                timing.duration.round() as u64
            );
            let _ = writeln!(out, "elapsed: {:.3}", timing.elapsed);
            let _ = writeln!(out, "duration: {:.3}", timing.duration);
        }
        out
    }
}

/// Songs whose position may have changed since `since`.
///
/// Adds shift everything after them, so the list is reported from the lowest
/// touched position onward. A clear marker sends the whole list.
fn plchanges(playlist: &Playlist, since: u64) -> String {
    let changes = playlist.changes_since(since);
    let start = changes
        .iter()
        .map(|c| match c.op {
            ChangeOp::Add => c.position,
            ChangeOp::Clear => 0,
        })
        .min();
    let Some(start) = start else {
        return String::new();
    };
    let mut out = String::new();
    for (pos, track) in playlist.tracks().iter().enumerate().skip(start) {
        write_track(&mut out, track, pos);
    }
    out
}

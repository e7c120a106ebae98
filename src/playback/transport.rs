//! Playback transport state machine
//!
//! User commands (play, pause, seek, shuffle...) are shown optimistically as
//! `TogglingTo` while the remote call is outstanding, then settle to `Set` or
//! roll back. Each command kind runs under its own [`SingleFlight`] so a slow
//! volume change never blocks a pause.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::remote::PlaybackRemote;
use crate::error::{self, ApiFailure, SharedError};
use crate::model::{
    CurrentlyPlaying, DeviceInfo, PlaybackSnapshot, PlayingItem, PlayingType, RepeatMode,
    SkipState, ToggleableState, TrackPosition,
};
use crate::sync::{Observable, SingleFlight, SyncContext};

const ERROR_CHANNEL_CAPACITY: usize = 16;

pub type ToggleCell<T> = Observable<Option<ToggleableState<T>>>;

/// Which transport operation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportOp {
    Play,
    Pause,
    SkipNext,
    SkipPrevious,
    Seek,
    SetRepeat,
    SetShuffle,
    SetVolume,
    Transfer,
    RefreshPlayback,
    RefreshTrack,
    RefreshDevices,
}

impl fmt::Display for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportOp::Play => "play",
            TransportOp::Pause => "pause",
            TransportOp::SkipNext => "skip to next",
            TransportOp::SkipPrevious => "skip to previous",
            TransportOp::Seek => "seek",
            TransportOp::SetRepeat => "set repeat",
            TransportOp::SetShuffle => "set shuffle",
            TransportOp::SetVolume => "set volume",
            TransportOp::Transfer => "transfer playback",
            TransportOp::RefreshPlayback => "refresh playback",
            TransportOp::RefreshTrack => "refresh track",
            TransportOp::RefreshDevices => "refresh devices",
        };
        f.write_str(name)
    }
}

impl TransportOp {
    fn is_refresh(self) -> bool {
        matches!(
            self,
            TransportOp::RefreshPlayback | TransportOp::RefreshTrack | TransportOp::RefreshDevices
        )
    }

    /// Short user-facing description of why this operation failed.
    pub fn describe_failure(self, error: &anyhow::Error) -> String {
        let message = match (error::classify(error), self) {
            (ApiFailure::NotFound, TransportOp::Transfer) => "That device is no longer available.",
            (ApiFailure::NotFound, op) if op.is_refresh() => "Spotify has no playback state to report.",
            (ApiFailure::NotFound, _) => "No active device. Start playing on Spotify and try again.",
            (ApiFailure::Forbidden, TransportOp::SetVolume) => {
                "This device does not allow volume control."
            }
            (ApiFailure::Forbidden, op) if op.is_refresh() => "Not allowed to read playback state.",
            (ApiFailure::Forbidden, _) => "Spotify refused the command. Player control needs Premium.",
            (ApiFailure::Unauthorized, _) => "Session expired. Sign in again.",
            (ApiFailure::RateLimited, _) => "Rate limited. Wait a moment and retry.",
            (ApiFailure::Other, _) => return error.to_string(),
        };
        message.to_string()
    }
}

/// A failed transport operation, as broadcast to observers
#[derive(Clone, Debug)]
pub struct TransportError {
    pub op: TransportOp,
    /// Short user-facing description.
    pub message: String,
    pub cause: SharedError,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.op, self.message)
    }
}

struct Flights {
    play: SingleFlight,
    pause: SingleFlight,
    skip_next: SingleFlight,
    skip_previous: SingleFlight,
    seek: SingleFlight,
    repeat: SingleFlight,
    shuffle: SingleFlight,
    volume: SingleFlight,
    transfer: SingleFlight,
    refresh_playback: SingleFlight,
    refresh_track: SingleFlight,
    refresh_devices: SingleFlight,
}

impl Flights {
    fn new() -> Self {
        Self {
            play: SingleFlight::new("play"),
            pause: SingleFlight::new("pause"),
            skip_next: SingleFlight::new("skip-next"),
            skip_previous: SingleFlight::new("skip-previous"),
            seek: SingleFlight::new("seek"),
            repeat: SingleFlight::new("set-repeat"),
            shuffle: SingleFlight::new("set-shuffle"),
            volume: SingleFlight::new("set-volume"),
            transfer: SingleFlight::new("transfer-device"),
            refresh_playback: SingleFlight::new("refresh-playback"),
            refresh_track: SingleFlight::new("refresh-track"),
            refresh_devices: SingleFlight::new("refresh-devices"),
        }
    }
}

struct Inner {
    ctx: SyncContext,
    remote: Arc<dyn PlaybackRemote>,
    flights: Flights,
    errors: broadcast::Sender<TransportError>,

    refreshing_playback: Observable<bool>,
    refreshing_track: Observable<bool>,
    refreshing_devices: Observable<bool>,
    playable: Observable<bool>,
    playing: ToggleCell<bool>,
    context_uri: Observable<Option<String>>,
    playing_type: Observable<Option<PlayingType>>,
    skipping: Observable<SkipState>,
    repeat_mode: ToggleCell<RepeatMode>,
    shuffle: ToggleCell<bool>,
    current_item: Observable<Option<PlayingItem>>,
    track_position: Observable<Option<TrackPosition>>,
    current_device: Observable<Option<DeviceInfo>>,
    devices: Observable<Option<Vec<DeviceInfo>>>,
    volume: ToggleCell<u8>,
}

/// Observable player state plus the commands that change it. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackTransport {
    inner: Arc<Inner>,
}

/// Puts an optimistic toggle back unless disarmed. Only reverts while the
/// cell still shows the target this command published.
struct RevertToggle<'a, T: Copy + PartialEq> {
    cell: &'a ToggleCell<T>,
    previous: Option<ToggleableState<T>>,
    target: T,
    armed: bool,
}

impl<T: Copy + PartialEq> RevertToggle<'_, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T: Copy + PartialEq> Drop for RevertToggle<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pending = Some(ToggleableState::TogglingTo(self.target));
        let previous = self.previous;
        self.cell
            .update_if(|current| (*current == pending).then_some(previous));
    }
}

/// Clears a refreshing flag when the refresh ends, however it ends.
struct Refreshing<'a>(&'a Observable<bool>);

impl<'a> Refreshing<'a> {
    fn start(flag: &'a Observable<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for Refreshing<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Settle `cell` to a remotely reported value, leaving in-flight toggles alone.
fn settle<T: Copy + PartialEq>(cell: &ToggleCell<T>, value: T) {
    cell.update_if(|current| match current {
        Some(ToggleableState::TogglingTo(_)) => None,
        Some(ToggleableState::Set(v)) if *v == value => None,
        _ => Some(Some(ToggleableState::Set(value))),
    });
}

fn set_if_changed<T: PartialEq>(cell: &Observable<T>, value: T) {
    cell.update_if(|current| (*current != value).then_some(value));
}

impl PlaybackTransport {
    pub fn new(ctx: &SyncContext, remote: Arc<dyn PlaybackRemote>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ctx: ctx.clone(),
                remote,
                flights: Flights::new(),
                errors,
                refreshing_playback: Observable::new(false),
                refreshing_track: Observable::new(false),
                refreshing_devices: Observable::new(false),
                playable: Observable::new(false),
                playing: Observable::new(None),
                context_uri: Observable::new(None),
                playing_type: Observable::new(None),
                skipping: Observable::new(SkipState::NotSkipping),
                repeat_mode: Observable::new(None),
                shuffle: Observable::new(None),
                current_item: Observable::new(None),
                track_position: Observable::new(None),
                current_device: Observable::new(None),
                devices: Observable::new(None),
                volume: Observable::new(None),
            }),
        }
    }

    pub fn refreshing_playback(&self) -> &Observable<bool> {
        &self.inner.refreshing_playback
    }

    pub fn refreshing_track(&self) -> &Observable<bool> {
        &self.inner.refreshing_track
    }

    pub fn refreshing_devices(&self) -> &Observable<bool> {
        &self.inner.refreshing_devices
    }

    /// Whether there is an active device that can take commands.
    pub fn playable(&self) -> &Observable<bool> {
        &self.inner.playable
    }

    pub fn playing(&self) -> &ToggleCell<bool> {
        &self.inner.playing
    }

    pub fn context_uri(&self) -> &Observable<Option<String>> {
        &self.inner.context_uri
    }

    pub fn playing_type(&self) -> &Observable<Option<PlayingType>> {
        &self.inner.playing_type
    }

    pub fn skipping(&self) -> &Observable<SkipState> {
        &self.inner.skipping
    }

    pub fn repeat_mode(&self) -> &ToggleCell<RepeatMode> {
        &self.inner.repeat_mode
    }

    pub fn shuffle(&self) -> &ToggleCell<bool> {
        &self.inner.shuffle
    }

    pub fn current_item(&self) -> &Observable<Option<PlayingItem>> {
        &self.inner.current_item
    }

    pub fn track_position(&self) -> &Observable<Option<TrackPosition>> {
        &self.inner.track_position
    }

    pub fn current_device(&self) -> &Observable<Option<DeviceInfo>> {
        &self.inner.current_device
    }

    pub fn devices(&self) -> &Observable<Option<Vec<DeviceInfo>>> {
        &self.inner.devices
    }

    pub fn volume(&self) -> &ToggleCell<u8> {
        &self.inner.volume
    }

    /// Failed operations, in the order they failed.
    pub fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.inner.errors.subscribe()
    }

    /// Live position of the current item, clamped to its duration when known.
    pub fn position_ms(&self) -> Option<u32> {
        let now = self.inner.ctx.clock.now_ms();
        let position = self.inner.track_position.get()?;
        let duration = self
            .inner
            .current_item
            .with(|item| item.as_ref().map(PlayingItem::duration_ms));
        Some(match duration {
            Some(duration) => position.clamped_position_ms(now, duration),
            None => position.current_position_ms(now),
        })
    }

    fn launch<Fut>(
        &self,
        flight: fn(&Flights) -> &SingleFlight,
        task: impl FnOnce(Self) -> Fut,
    ) -> Option<JoinHandle<()>>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        flight(&self.inner.flights).launch(&self.inner.ctx.handle, task(self.clone()))
    }

    fn report(&self, op: TransportOp, e: anyhow::Error) {
        let message = op.describe_failure(&e);
        tracing::warn!(operation = %op, error = %e, "Transport operation failed");
        // no receivers is fine
        let _ = self.inner.errors.send(TransportError {
            op,
            message,
            cause: error::share(e),
        });
    }

    /// Publish `TogglingTo(target)`, run `call`, then settle or roll back.
    async fn toggle<T, Fut>(
        &self,
        op: TransportOp,
        cell: &ToggleCell<T>,
        target: T,
        call: Fut,
    ) -> bool
    where
        T: Copy + PartialEq + fmt::Debug,
        Fut: Future<Output = Result<()>>,
    {
        let revert = RevertToggle {
            cell,
            previous: cell.get(),
            target,
            armed: true,
        };
        cell.set(Some(ToggleableState::TogglingTo(target)));
        tracing::debug!(operation = %op, target = ?target, "Transport command sent");

        match call.await {
            Ok(()) => {
                revert.disarm();
                cell.set(Some(ToggleableState::Set(target)));
                true
            }
            Err(e) => {
                self.report(op, e);
                false
            }
        }
    }

    pub fn play(&self) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.play, |this| async move { this.set_playing(true).await })
    }

    pub fn pause(&self) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.pause, |this| async move { this.set_playing(false).await })
    }

    /// Pause when playing (or about to be), play otherwise.
    pub fn toggle_play(&self) -> Option<JoinHandle<()>> {
        let playing = self.inner.playing.get().is_some_and(|s| s.value());
        if playing { self.pause() } else { self.play() }
    }

    async fn set_playing(&self, playing: bool) {
        let inner = &self.inner;
        let (op, call) = if playing {
            (TransportOp::Play, inner.remote.start())
        } else {
            (TransportOp::Pause, inner.remote.pause())
        };
        if self.toggle(op, &inner.playing, playing, call).await {
            let now = inner.ctx.clock.now_ms();
            inner.track_position.update(|position| {
                position.map(|p| if playing { p.play(now) } else { p.pause(now) })
            });
        }
    }

    pub fn skip_to_next(&self) -> Option<JoinHandle<()>> {
        self.launch(
            |f| &f.skip_next,
            |this| async move { this.skip(SkipState::SkippingToNext).await },
        )
    }

    pub fn skip_to_previous(&self) -> Option<JoinHandle<()>> {
        self.launch(
            |f| &f.skip_previous,
            |this| async move { this.skip(SkipState::SkippingToPrevious).await },
        )
    }

    async fn skip(&self, direction: SkipState) {
        let inner = &self.inner;
        let (op, call) = match direction {
            SkipState::SkippingToPrevious => (TransportOp::SkipPrevious, inner.remote.skip_previous()),
            _ => (TransportOp::SkipNext, inner.remote.skip_next()),
        };

        inner.skipping.set(direction);
        let result = call.await;
        inner.skipping.set(SkipState::NotSkipping);

        match result {
            Ok(()) => {
                tracing::debug!(operation = %op, "Skipped, refreshing track");
                if let Some(refresh) = self.refresh_track() {
                    // the refresh outlives this task if it is aborted
                    let _ = refresh.await;
                }
            }
            Err(e) => self.report(op, e),
        }
    }

    pub fn seek_to_position(&self, position_ms: u32) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.seek, move |this| async move { this.seek(position_ms).await })
    }

    async fn seek(&self, target_ms: u32) {
        let inner = &self.inner;
        let previous = inner.track_position.get();
        let seeking = Some(TrackPosition::Seeking { target_ms });
        inner.track_position.set(seeking);

        let result = inner.remote.seek(target_ms).await;

        match result {
            Ok(()) => {
                let now = inner.ctx.clock.now_ms();
                let playing = inner.playing.get().is_some_and(|s| s.value());
                inner
                    .track_position
                    .set(Some(TrackPosition::fetched(now, target_ms, playing)));
            }
            Err(e) => {
                inner
                    .track_position
                    .update_if(|current| (*current == seeking).then_some(previous));
                self.report(TransportOp::Seek, e);
            }
        }
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.repeat, move |this| async move {
            let inner = &this.inner;
            this.toggle(
                TransportOp::SetRepeat,
                &inner.repeat_mode,
                mode,
                inner.remote.set_repeat(mode),
            )
            .await;
        })
    }

    /// Off, then all, then one.
    pub fn cycle_repeat_mode(&self) -> Option<JoinHandle<()>> {
        let current = self
            .inner
            .repeat_mode
            .get()
            .map(|s| s.value())
            .unwrap_or_default();
        self.set_repeat_mode(current.next())
    }

    pub fn set_shuffle(&self, shuffle: bool) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.shuffle, move |this| async move {
            let inner = &this.inner;
            this.toggle(
                TransportOp::SetShuffle,
                &inner.shuffle,
                shuffle,
                inner.remote.set_shuffle(shuffle),
            )
            .await;
        })
    }

    pub fn toggle_shuffle(&self) -> Option<JoinHandle<()>> {
        let shuffle = self.inner.shuffle.get().is_some_and(|s| s.value());
        self.set_shuffle(!shuffle)
    }

    /// Values above 100 are clamped.
    pub fn set_volume(&self, percent: u8) -> Option<JoinHandle<()>> {
        let percent = percent.min(100);
        self.launch(|f| &f.volume, move |this| async move {
            let inner = &this.inner;
            this.toggle(
                TransportOp::SetVolume,
                &inner.volume,
                percent,
                inner.remote.set_volume(percent),
            )
            .await;
        })
    }

    /// Move playback to `device_id`, optionally starting it there.
    pub fn transfer_playback(&self, device_id: impl Into<String>, play: bool) -> Option<JoinHandle<()>> {
        let device_id = device_id.into();
        self.launch(|f| &f.transfer, move |this| async move {
            this.transfer(&device_id, play).await
        })
    }

    async fn transfer(&self, device_id: &str, play: bool) {
        let inner = &self.inner;
        if let Err(e) = inner.remote.transfer(device_id, play).await {
            self.report(TransportOp::Transfer, e);
            return;
        }
        tracing::info!(device_id, play, "Playback transferred");

        let known = inner.devices.get().unwrap_or_default();
        let devices: Vec<DeviceInfo> = known
            .into_iter()
            .map(|mut device| {
                device.is_active = device.id == device_id;
                device
            })
            .collect();
        let active = devices.iter().find(|d| d.is_active).cloned();
        if !devices.is_empty() {
            inner.devices.set(Some(devices));
        }
        if let Some(device) = active {
            inner.playable.set(true);
            inner.current_device.set(Some(device));
        }
        if play {
            settle(&inner.playing, true);
        }

        if let Some(refresh) = self.refresh_playback() {
            let _ = refresh.await;
        }
    }

    pub fn refresh_playback(&self) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.refresh_playback, |this| async move { this.sync_playback().await })
    }

    async fn sync_playback(&self) {
        let inner = &self.inner;
        let _refreshing = Refreshing::start(&inner.refreshing_playback);

        let started = inner.ctx.clock.now_ms();
        let fetched = inner.remote.current_playback().await;
        let finished = inner.ctx.clock.now_ms();

        match fetched {
            Ok(Some(snapshot)) => self.merge_playback(snapshot, started + (finished - started) / 2),
            Ok(None) => {
                tracing::debug!("No active playback");
                inner.playable.set(false);
                set_if_changed(&inner.current_device, None);
                settle(&inner.playing, false);
                let now = inner.ctx.clock.now_ms();
                inner.track_position.update_if(|position| match position {
                    Some(p @ TrackPosition::Fetched { playing: true, .. }) => Some(Some(p.pause(now))),
                    _ => None,
                });
            }
            Err(e) => self.report(TransportOp::RefreshPlayback, e),
        }
    }

    fn merge_playback(&self, snapshot: PlaybackSnapshot, fetched_at_ms: i64) {
        let inner = &self.inner;
        tracing::trace!(
            is_playing = snapshot.is_playing,
            device = ?snapshot.device.as_ref().map(|d| &d.name),
            "Merging playback state"
        );

        inner.playable.set(snapshot.device.is_some());
        if let Some(volume) = snapshot.device.as_ref().and_then(|d| d.volume_percent) {
            settle(&inner.volume, volume);
        }
        set_if_changed(&inner.current_device, snapshot.device);
        settle(&inner.shuffle, snapshot.shuffle);
        settle(&inner.repeat_mode, snapshot.repeat);
        settle(&inner.playing, snapshot.is_playing);
        set_if_changed(&inner.context_uri, snapshot.context_uri);
        set_if_changed(&inner.playing_type, Some(snapshot.playing_type));

        // the track refresh owns the item; fill it only when nothing is shown yet
        if inner.current_item.with(Option::is_none) {
            if let Some(item) = snapshot.item {
                inner.current_item.set(Some(item));
            }
        }
        if inner.track_position.with(Option::is_none) {
            if let Some(progress) = snapshot.progress_ms {
                inner.track_position.set(Some(TrackPosition::fetched(
                    fetched_at_ms,
                    progress,
                    snapshot.is_playing,
                )));
            }
        }
    }

    pub fn refresh_track(&self) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.refresh_track, |this| async move { this.sync_track().await })
    }

    async fn sync_track(&self) {
        let inner = &self.inner;
        let _refreshing = Refreshing::start(&inner.refreshing_track);

        let started = inner.ctx.clock.now_ms();
        let fetched = inner.remote.currently_playing().await;
        let finished = inner.ctx.clock.now_ms();

        match fetched {
            Ok(Some(current)) => self.merge_track(current, started + (finished - started) / 2),
            Ok(None) => {
                tracing::debug!("Nothing playing");
                set_if_changed(&inner.current_item, None);
                set_if_changed(&inner.track_position, None);
            }
            Err(e) => self.report(TransportOp::RefreshTrack, e),
        }
    }

    fn merge_track(&self, current: CurrentlyPlaying, fetched_at_ms: i64) {
        let inner = &self.inner;
        tracing::trace!(
            item = ?current.item.as_ref().map(PlayingItem::id),
            progress_ms = ?current.progress_ms,
            "Merging currently playing"
        );

        set_if_changed(&inner.current_item, current.item);
        set_if_changed(&inner.context_uri, current.context_uri);
        set_if_changed(&inner.playing_type, Some(current.playing_type));
        settle(&inner.playing, current.is_playing);

        // an outstanding seek wins over the reported position
        let position = current
            .progress_ms
            .map(|progress| TrackPosition::fetched(fetched_at_ms, progress, current.is_playing));
        inner.track_position.update_if(|existing| match existing {
            Some(TrackPosition::Seeking { .. }) => None,
            _ => Some(position),
        });
    }

    pub fn refresh_devices(&self) -> Option<JoinHandle<()>> {
        self.launch(|f| &f.refresh_devices, |this| async move { this.sync_devices().await })
    }

    async fn sync_devices(&self) {
        let inner = &self.inner;
        let _refreshing = Refreshing::start(&inner.refreshing_devices);

        match inner.remote.devices().await {
            Ok(devices) => {
                tracing::debug!(count = devices.len(), "Devices refreshed");
                let active = devices.iter().find(|d| d.is_active).cloned();
                inner.playable.set(active.is_some());
                set_if_changed(&inner.current_device, active);
                set_if_changed(&inner.devices, Some(devices));
            }
            Err(e) => self.report(TransportOp::RefreshDevices, e),
        }
    }
}

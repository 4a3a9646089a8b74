//! Collaboration session coordinator.
//!
//! A [`Session`] owns one collaboration lifecycle: it opens the portal, decides
//! whether the scene comes from a peer or from storage, pushes local edits out,
//! folds remote edits in, and keeps storage and attachments up to date.
//!
//! The session is driven from the host's event loop. Local edits go through
//! [`Session::sync_elements`]; everything else (socket traffic, throttled
//! queues, fallback timers, idle tracking) advances in [`Session::poll`].
//! Both take the current [`Instant`] so timing is explicit.

use crate::config::CollabConfig;
use crate::element::{Element, FileStatus, now_millis, scene_version, syncable_elements};
use crate::error::{CollabError, CollabResult};
use crate::files::{FileManager, update_stale_image_statuses};
use crate::host::DocumentHost;
use crate::idle::{ActivitySignal, ActivitySource, IdleDetector};
use crate::portal::{ChannelState, Portal, PortalEvent};
use crate::presence::{CollaboratorUpdate, Collaborators, PointerButton, UserFollowPayload, UserIdleState};
use crate::protocol::{SceneUpdateKind, SocketUpdate};
use crate::reconcile::{ReconcileContext, reconcile};
use crate::room::RoomLinkData;
use crate::socket::{SocketConnector, SocketError};
use crate::storage::{RemoteStore, SaveOutcome, SceneStore, StorageError};
use crate::throttle::Throttle;
use kurbo::Point;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Instant;

/// Shown when a save fails for an unspecific reason.
pub const SAVE_FAILED_MESSAGE: &str = "Couldn't save to the backend database. If problems persist, \
     you should save your file locally to ensure you don't lose your work.";

/// Shown when the backend rejects the scene as too large.
pub const SAVE_FAILED_SIZE_EXCEEDED_MESSAGE: &str = "Couldn't save to the backend database, the canvas \
     seems to be too big. You should save the file locally to ensure you don't lose your work.";

pub const CONNECTION_LOST_MESSAGE: &str = "Connection to the collaboration server was lost.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Starting,
    /// Waiting for a peer snapshot, first-in-room notice or the fallback timer.
    WaitingForFirstPeerResponse,
    Active,
    Stopping,
}

/// Observable session state, pushed to subscribers on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub is_collaborating: bool,
    /// Reported by the host.
    pub is_offline: bool,
    /// Shareable link of the current room.
    pub active_room_link: Option<String>,
    /// Transient error shown while collaborating.
    pub error_indicator: Option<String>,
    /// Error that warrants a dialog; cleared by [`Session::dismiss_error_dialog`].
    pub error_dialog: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct PointerUpdate {
    pointer: Point,
    button: PointerButton,
}

fn version_of(elements: &[Element]) -> i64 {
    i64::try_from(scene_version(elements)).unwrap_or(i64::MAX)
}

fn log_send_error(what: &str, result: Result<(), SocketError>) {
    if let Err(e) = result {
        log::warn!("Failed to broadcast {}: {}", what, e);
    }
}

pub struct Session<C: SocketConnector, R: RemoteStore> {
    config: CollabConfig,
    /// Scheme and host used to build room links.
    origin: String,
    connector: C,
    portal: Portal<C::Socket>,
    scene_store: SceneStore<R>,
    files: FileManager<R>,
    collaborators: Collaborators,
    idle: IdleDetector,
    activity: Option<Box<dyn ActivitySource>>,
    /// Scene version last sent or received; echo suppression for remote updates.
    last_broadcasted_or_received_scene_version: i64,
    /// When to stop waiting for a peer and load from storage.
    init_deadline: Option<Instant>,
    broadcast_all_queue: Throttle<()>,
    save_queue: Throttle<()>,
    file_upload_queue: Throttle<()>,
    load_images_queue: Throttle<()>,
    pointer_queue: Throttle<PointerUpdate>,
    viewport_queue: Throttle<()>,
    /// Error messages already shown as a dialog.
    dialog_notified_errors: HashSet<String>,
    status: SessionStatus,
    subscribers: Vec<Sender<SessionStatus>>,
}

impl<C: SocketConnector, R: RemoteStore> Session<C, R> {
    pub fn new(config: CollabConfig, connector: C, store: R, origin: impl Into<String>) -> Self {
        Self::with_shared_store(config, connector, Arc::new(store), origin)
    }

    pub fn with_shared_store(config: CollabConfig, connector: C, store: Arc<R>, origin: impl Into<String>) -> Self {
        let deleted_timeout = config.deleted_element_timeout_ms();
        Self {
            origin: origin.into(),
            connector,
            portal: Portal::new(deleted_timeout),
            scene_store: SceneStore::new(Arc::clone(&store), deleted_timeout),
            files: FileManager::new(store, config.file_upload_max_bytes),
            collaborators: Collaborators::new(),
            idle: IdleDetector::new(config.idle_threshold(), config.active_threshold()),
            activity: None,
            last_broadcasted_or_received_scene_version: -1,
            init_deadline: None,
            broadcast_all_queue: Throttle::new(config.sync_full_scene_interval()),
            save_queue: Throttle::trailing(config.sync_full_scene_interval()),
            file_upload_queue: Throttle::new(config.file_upload_timeout()),
            load_images_queue: Throttle::new(config.load_images_timeout()),
            pointer_queue: Throttle::new(config.cursor_sync_timeout()),
            viewport_queue: Throttle::new(config.cursor_sync_timeout()),
            dialog_notified_errors: HashSet::new(),
            status: SessionStatus::default(),
            subscribers: Vec::new(),
            config,
        }
    }

    /// Drive the idle state machine from `source` on every poll.
    pub fn with_activity_source(mut self, source: Box<dyn ActivitySource>) -> Self {
        self.activity = Some(source);
        self
    }

    // --- Observable state ---

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Receive a copy of the status now and after every change.
    pub fn subscribe(&mut self) -> Receiver<SessionStatus> {
        let (tx, rx) = channel();
        let _ = tx.send(self.status.clone());
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self) {
        let status = self.status.clone();
        self.subscribers.retain(|tx| tx.send(status.clone()).is_ok());
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.status.phase != phase {
            log::debug!("Session phase {:?} -> {:?}", self.status.phase, phase);
            self.status.phase = phase;
            self.notify();
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.status.phase
    }

    pub fn is_collaborating(&self) -> bool {
        self.status.is_collaborating
    }

    pub fn channel_state(&self) -> ChannelState {
        self.portal.state()
    }

    pub fn room(&self) -> Option<&RoomLinkData> {
        self.portal.room()
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.portal.socket_id()
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn last_broadcasted_or_received_scene_version(&self) -> i64 {
        self.last_broadcasted_or_received_scene_version
    }

    pub fn idle_state(&self) -> UserIdleState {
        self.idle.state()
    }

    pub fn set_offline(&mut self, offline: bool) {
        if self.status.is_offline != offline {
            self.status.is_offline = offline;
            self.notify();
        }
    }

    pub fn dismiss_error_dialog(&mut self) {
        if self.status.error_dialog.take().is_some() {
            self.notify();
        }
    }

    pub fn reset_error_indicator(&mut self) {
        if self.status.error_indicator.take().is_some() {
            self.notify();
        }
    }

    // --- Lifecycle ---

    /// Start collaborating in `existing_room`, or in a brand-new room.
    ///
    /// A no-op while a session is already running. Fails without leaving any
    /// session state behind when no server url is configured or the transport
    /// cannot be opened. The scene arrives later through [`poll`](Self::poll):
    /// from the first peer that answers, or from storage once the server says
    /// we are alone or the initial-scene timeout expires.
    ///
    /// In a brand-new room, tombstones are dropped and stored attachments are
    /// marked pending again before the first save, so nothing deleted earlier
    /// leaks into the room.
    pub async fn start_collaboration<H: DocumentHost>(
        &mut self,
        host: &mut H,
        existing_room: Option<RoomLinkData>,
        now: Instant,
    ) -> CollabResult<()> {
        if self.portal.has_socket() {
            return Ok(());
        }
        let url = self.config.ws_server_url.clone().ok_or(CollabError::NoServerUrl)?;
        let is_new_room = existing_room.is_none();
        let room = existing_room.unwrap_or_else(RoomLinkData::generate);

        self.set_phase(SessionPhase::Starting);
        let socket = match self.connector.connect(&url, self.config.auth_token.as_deref()) {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("Could not open collaboration channel: {}", e);
                self.set_phase(SessionPhase::Idle);
                return Err(e.into());
            }
        };

        log::info!("Starting collaboration in room {}", room.room_id);
        host.set_local_persistence_paused(true);
        self.portal.open(socket, room.clone());
        self.last_broadcasted_or_received_scene_version = -1;
        self.init_deadline = Some(now + self.config.initial_scene_update_timeout());
        self.idle.reset();
        self.status.is_collaborating = true;
        self.status.active_room_link = Some(room.link(&self.origin));
        self.status.error_indicator = None;
        self.set_phase(SessionPhase::WaitingForFirstPeerResponse);
        self.notify();

        if is_new_room {
            let elements: Vec<Element> = host
                .elements_including_deleted()
                .into_iter()
                .filter(|el| !el.is_deleted)
                .map(|el| {
                    if el.is_image() && el.status == Some(FileStatus::Saved) {
                        el.with_status(FileStatus::Pending)
                    } else {
                        el
                    }
                })
                .collect();
            host.apply_elements(elements);
            self.save_collab_room(host, now).await;
        }
        Ok(())
    }

    /// Stop collaborating.
    ///
    /// Pending persistence is flushed before the channel closes. When
    /// `keep_remote_state` is false, or `confirm_keep` declines, stored
    /// attachments revert to pending and the room link is dropped.
    pub async fn stop_collaboration<H: DocumentHost>(
        &mut self,
        host: &mut H,
        keep_remote_state: bool,
        confirm_keep: impl FnOnce() -> bool,
        now: Instant,
    ) {
        if !self.portal.has_socket() {
            return;
        }
        self.set_phase(SessionPhase::Stopping);
        self.cancel_queues();
        self.init_deadline = None;
        self.status.error_indicator = None;

        self.save_collab_room(host, now).await;

        let keep = keep_remote_state && confirm_keep();
        log::info!("Stopping collaboration (keep remote state: {})", keep);
        self.close_room(host);

        if !keep {
            let elements = host
                .elements_including_deleted()
                .into_iter()
                .map(|el| {
                    if el.is_image() && el.status == Some(FileStatus::Saved) {
                        el.with_status(FileStatus::Pending)
                    } else {
                        el
                    }
                })
                .collect();
            host.apply_elements(elements);
            self.status.active_room_link = None;
        }

        self.set_phase(SessionPhase::Idle);
        self.notify();
    }

    /// Drop the channel and all per-room state. The room link is kept.
    fn close_room<H: DocumentHost>(&mut self, host: &mut H) {
        self.cancel_queues();
        self.init_deadline = None;
        self.portal.close();
        self.files.reset();
        self.collaborators.clear();
        host.set_collaborators(&self.collaborators);
        self.dialog_notified_errors.clear();
        self.last_broadcasted_or_received_scene_version = -1;
        self.idle.reset();
        self.status.is_collaborating = false;
        host.set_local_persistence_paused(false);
    }

    fn cancel_queues(&mut self) {
        self.broadcast_all_queue.cancel();
        self.save_queue.cancel();
        self.file_upload_queue.cancel();
        self.load_images_queue.cancel();
        self.pointer_queue.cancel();
        self.viewport_queue.cancel();
    }

    /// Called when the host is about to go away. Tries to persist anything
    /// unsaved and returns whether unsaved work remains.
    pub async fn before_unload<H: DocumentHost>(&mut self, host: &mut H, now: Instant) -> bool {
        if !self.status.is_collaborating {
            return false;
        }
        if !self.has_unsaved_work(host) {
            return false;
        }
        self.broadcast_all_queue.cancel();
        self.broadcast_all(host);
        self.save_queue.cancel();
        self.upload_files(host, now).await;
        self.save_collab_room(host, now).await;
        self.has_unsaved_work(host)
    }

    fn has_unsaved_work<H: DocumentHost>(&self, host: &H) -> bool {
        let elements = host.elements_including_deleted();
        if self.files.should_prevent_unload(&elements) {
            return true;
        }
        let syncable = self.syncable(&elements);
        self.portal
            .room()
            .is_some_and(|room| !self.scene_store.is_saved(room, &syncable))
    }

    /// Persist now, bypassing the save queue.
    pub async fn flush<H: DocumentHost>(&mut self, host: &mut H, now: Instant) -> CollabResult<()> {
        if self.portal.room().is_none() {
            return Err(CollabError::Aborted);
        }
        self.save_queue.cancel();
        self.save_collab_room(host, now).await;
        Ok(())
    }

    // --- Local edits ---

    /// Entry point for local edits.
    ///
    /// A no-op unless the scene version grew since the last broadcast or
    /// receive. Sends the changed elements right away. With
    /// `fire_immediately` the full scene is broadcast and saved before
    /// returning; otherwise both go through their throttled queues.
    pub async fn sync_elements<H: DocumentHost>(&mut self, host: &mut H, fire_immediately: bool, now: Instant) {
        if !self.broadcast_local_changes(host, now) {
            return;
        }
        if self.file_upload_queue.schedule((), now).is_some() {
            self.upload_files(host, now).await;
        }
        if fire_immediately {
            self.broadcast_all_queue.cancel();
            self.broadcast_all(host);
            self.save_queue.cancel();
            self.save_collab_room(host, now).await;
        }
    }

    /// Broadcast the delta if the scene grew, and queue the full broadcast and save.
    fn broadcast_local_changes<H: DocumentHost>(&mut self, host: &H, now: Instant) -> bool {
        if !self.status.is_collaborating {
            return false;
        }
        let elements = host.elements_including_deleted();
        let version = version_of(&elements);
        if version <= self.last_broadcasted_or_received_scene_version {
            return false;
        }
        log_send_error(
            "scene update",
            self.portal.broadcast_scene(SceneUpdateKind::Update, &elements, false),
        );
        self.last_broadcasted_or_received_scene_version = version;

        if self.broadcast_all_queue.schedule((), now).is_some() {
            self.broadcast_all(host);
        }
        self.save_queue.schedule((), now);
        true
    }

    fn broadcast_all<H: DocumentHost>(&mut self, host: &H) {
        let elements = host.elements_including_deleted();
        log_send_error(
            "full scene",
            self.portal.broadcast_scene(SceneUpdateKind::Update, &elements, true),
        );
        self.last_broadcasted_or_received_scene_version =
            self.last_broadcasted_or_received_scene_version.max(version_of(&elements));
    }

    fn syncable(&self, elements: &[Element]) -> Vec<Element> {
        syncable_elements(elements, now_millis(), self.config.deleted_element_timeout_ms())
    }

    async fn save_collab_room<H: DocumentHost>(&mut self, host: &mut H, now: Instant) {
        let Some(room) = self.portal.room().cloned() else {
            log::debug!("Skipping save, no active room");
            return;
        };
        let elements = self.syncable(&host.elements_including_deleted());
        let ctx = reconcile_context(host);

        match self.scene_store.save(&room, &elements, &ctx).await {
            Ok(SaveOutcome::AlreadySaved) => self.reset_error_indicator(),
            Ok(SaveOutcome::Stored(stored)) => {
                self.reset_error_indicator();
                if self.status.is_collaborating {
                    let reconciled = self.reconcile_with_local(host, &stored);
                    self.handle_remote_scene_update(host, reconciled, now).await;
                }
            }
            Ok(SaveOutcome::RemoteNewer { version }) => {
                self.reset_error_indicator();
                log::info!("Room {} was saved elsewhere (version {}), pulling it", room.room_id, version);
                self.pull_stored_scene(host, &room, now).await;
                // our own edits still need to reach storage
                if self.status.is_collaborating {
                    self.save_queue.schedule((), now);
                }
            }
            Err(e) => self.report_save_error(&e),
        }
    }

    /// Load the stored scene and fold it into the local one.
    async fn pull_stored_scene<H: DocumentHost>(&mut self, host: &mut H, room: &RoomLinkData, now: Instant) {
        match self.scene_store.load(room).await {
            Ok(Some(elements)) => {
                log::info!("Loaded {} elements for room {}", elements.len(), room.room_id);
                let reconciled = self.reconcile_with_local(host, &elements);
                self.handle_remote_scene_update(host, reconciled, now).await;
            }
            Ok(None) => log::info!("Room {} has no stored scene", room.room_id),
            Err(e) => log::error!("Failed to load room {}: {}", room.room_id, e),
        }
    }

    fn report_save_error(&mut self, error: &StorageError) {
        log::error!("Failed to save collaboration room: {}", error);
        let message = if error.is_size_exceeded() {
            SAVE_FAILED_SIZE_EXCEEDED_MESSAGE
        } else {
            SAVE_FAILED_MESSAGE
        };
        if !self.dialog_notified_errors.contains(message) || !self.status.is_collaborating {
            self.status.error_dialog = Some(message.to_string());
            self.dialog_notified_errors.insert(message.to_string());
        }
        if self.status.is_collaborating {
            self.status.error_indicator = Some(message.to_string());
        }
        self.notify();
    }

    async fn upload_files<H: DocumentHost>(&mut self, host: &mut H, now: Instant) {
        let Some(room) = self.portal.room().cloned() else {
            return;
        };
        let outcome = self
            .files
            .save_files(&room, &host.elements_including_deleted(), &host.files())
            .await;
        if outcome.saved.is_empty() {
            return;
        }

        // Re-read: the scene may have changed while uploading.
        let mut changed = false;
        let elements: Vec<Element> = host
            .elements_including_deleted()
            .into_iter()
            .map(|el| {
                if self.files.should_update_image_element_status(&el) {
                    changed = true;
                    el.with_status(FileStatus::Saved)
                } else {
                    el
                }
            })
            .collect();
        if changed {
            host.apply_elements(elements);
            self.broadcast_local_changes(host, now);
        }
    }

    // --- Remote edits ---

    fn reconcile_with_local<H: DocumentHost>(&self, host: &H, remote: &[Element]) -> Vec<Element> {
        reconcile(&host.elements_including_deleted(), remote, &reconcile_context(host))
    }

    /// Apply a reconciled scene. The version is recorded first so the change
    /// is not echoed back as a local edit.
    async fn handle_remote_scene_update<H: DocumentHost>(&mut self, host: &mut H, elements: Vec<Element>, now: Instant) {
        self.last_broadcasted_or_received_scene_version = version_of(&elements);
        host.apply_elements(elements);
        if self.load_images_queue.schedule((), now).is_some() {
            self.load_image_files(host, now).await;
        }
    }

    async fn load_image_files<H: DocumentHost>(&mut self, host: &mut H, now: Instant) {
        let Some(room) = self.portal.room().cloned() else {
            return;
        };
        let grace_ms = i64::try_from(self.config.stale_file_grace_ms).unwrap_or(i64::MAX);
        let ids = self
            .files
            .unfetched_image_ids(&host.elements_including_deleted(), true, now_millis(), grace_ms);
        if ids.is_empty() {
            return;
        }
        let outcome = self.files.get_files(&room, &ids).await;
        if !outcome.loaded.is_empty() {
            host.add_files(outcome.loaded);
        }
        if let Some(updated) = update_stale_image_statuses(&host.elements_including_deleted(), &outcome.errored) {
            host.apply_elements(updated);
            self.broadcast_local_changes(host, now);
        }
    }

    /// Mark the scene as acquired, loading it from storage first when asked.
    async fn initialize_room<H: DocumentHost>(&mut self, host: &mut H, fetch_scene: bool, now: Instant) {
        self.init_deadline = None;
        if fetch_scene {
            if let Some(room) = self.portal.room().cloned() {
                self.pull_stored_scene(host, &room, now).await;
            }
        }
        self.portal.mark_initialized();
        self.set_phase(SessionPhase::Active);
    }

    // --- Event loop ---

    /// Advance the session: socket events, fallback timer, queues, idle state.
    pub async fn poll<H: DocumentHost>(&mut self, host: &mut H, now: Instant) {
        for event in self.portal.poll() {
            self.handle_portal_event(host, event, now).await;
            if !self.portal.has_socket() {
                break;
            }
        }

        if let Some(deadline) = self.init_deadline {
            if now >= deadline && !self.portal.is_initialized() {
                log::info!("No scene from peers in time, loading from storage");
                self.initialize_room(host, true, now).await;
            }
        }

        if self.broadcast_all_queue.poll(now).is_some() {
            self.broadcast_all(host);
        }
        if self.save_queue.poll(now).is_some() {
            self.save_collab_room(host, now).await;
        }
        if self.file_upload_queue.poll(now).is_some() {
            self.upload_files(host, now).await;
        }
        if self.load_images_queue.poll(now).is_some() {
            self.load_image_files(host, now).await;
        }
        if let Some(update) = self.pointer_queue.poll(now) {
            self.send_pointer(host, update);
        }
        if self.viewport_queue.poll(now).is_some() {
            self.relay_visible_scene_bounds(host, false);
        }

        let signals = self.activity.as_mut().map(|source| source.drain()).unwrap_or_default();
        for signal in signals {
            self.on_activity(signal, now);
        }
        if let Some(state) = self.idle.tick(now) {
            self.broadcast_idle(state);
        }
    }

    async fn handle_portal_event<H: DocumentHost>(&mut self, host: &mut H, event: PortalEvent, now: Instant) {
        match event {
            PortalEvent::ConnectError(message) => {
                log::error!("Collaboration connect error: {}", message);
                if !self.portal.is_initialized() {
                    self.initialize_room(host, true, now).await;
                }
            }
            PortalEvent::Disconnected => {
                log::warn!("Collaboration socket disconnected, closing the room");
                // storage is still reachable; keep what peers never saw
                self.save_queue.cancel();
                self.save_collab_room(host, now).await;
                self.close_room(host);
                self.status.error_indicator = Some(CONNECTION_LOST_MESSAGE.to_string());
                self.set_phase(SessionPhase::Idle);
                self.notify();
            }
            PortalEvent::FirstInRoom => {
                if !self.portal.is_initialized() {
                    self.initialize_room(host, true, now).await;
                }
            }
            PortalEvent::NewUser(socket_id) => {
                if self.portal.is_initialized() {
                    log::debug!("Sending scene snapshot to {}", socket_id);
                    let elements = host.elements_including_deleted();
                    log_send_error(
                        "scene snapshot",
                        self.portal.broadcast_scene(SceneUpdateKind::Init, &elements, true),
                    );
                }
            }
            PortalEvent::RoomUserChange(clients) => {
                self.collaborators.set_roster(&clients, self.portal.socket_id());
                host.set_collaborators(&self.collaborators);
            }
            PortalEvent::FollowedBy(followed_by) => {
                host.set_followed_by(followed_by);
                self.relay_visible_scene_bounds(host, true);
            }
            PortalEvent::ServerError(message) => log::warn!("Server error: {}", message),
            PortalEvent::Update(update) => self.handle_update(host, update, now).await,
        }
    }

    async fn handle_update<H: DocumentHost>(&mut self, host: &mut H, update: SocketUpdate, now: Instant) {
        match update {
            SocketUpdate::InvalidResponse => {}
            SocketUpdate::Init { elements } => {
                if !self.portal.is_initialized() {
                    self.initialize_room(host, false, now).await;
                    let reconciled = self.reconcile_with_local(host, &elements);
                    self.handle_remote_scene_update(host, reconciled, now).await;
                }
            }
            SocketUpdate::Update { elements } => {
                let reconciled = self.reconcile_with_local(host, &elements);
                self.handle_remote_scene_update(host, reconciled, now).await;
            }
            SocketUpdate::MouseLocation {
                socket_id,
                pointer,
                button,
                selected_element_ids,
                username,
            } => {
                let update = CollaboratorUpdate {
                    pointer: Some(pointer),
                    button: Some(button),
                    selected_element_ids: Some(selected_element_ids),
                    username,
                    ..Default::default()
                };
                self.collaborators.update(&socket_id, update, self.portal.socket_id());
                host.set_collaborators(&self.collaborators);
            }
            SocketUpdate::UserVisibleSceneBounds {
                socket_id, scene_bounds, ..
            } => {
                let app_state = host.app_state();
                let following_sender = app_state.user_to_follow.as_deref() == Some(socket_id.as_str());
                // two users following each other would zoom back and forth forever
                let cross_follow = app_state.followed_by.contains(&socket_id);
                if following_sender && !cross_follow {
                    host.zoom_to_fit_bounds(scene_bounds);
                }
            }
            SocketUpdate::IdleStatus {
                socket_id,
                user_state,
                username,
            } => {
                let update = CollaboratorUpdate {
                    user_state: Some(user_state),
                    username,
                    ..Default::default()
                };
                self.collaborators.update(&socket_id, update, self.portal.socket_id());
                host.set_collaborators(&self.collaborators);
            }
        }
    }

    // --- Presence ---

    /// Report the local pointer. Throttled; multi-touch gestures are not shared.
    pub fn on_pointer_update<H: DocumentHost>(
        &mut self,
        host: &H,
        pointer: Point,
        button: PointerButton,
        pointer_count: usize,
        now: Instant,
    ) {
        if pointer_count >= 2 || !self.portal.has_socket() {
            return;
        }
        if let Some(update) = self.pointer_queue.schedule(PointerUpdate { pointer, button }, now) {
            self.send_pointer(host, update);
        }
    }

    fn send_pointer<H: DocumentHost>(&mut self, host: &H, update: PointerUpdate) {
        let selected = host.app_state().selected_element_ids;
        let username = self.config.username.clone();
        log_send_error(
            "pointer",
            self.portal
                .broadcast_mouse_location(update.pointer, update.button, selected, username),
        );
    }

    /// Feed one activity signal into the idle state machine.
    pub fn on_activity(&mut self, signal: ActivitySignal, now: Instant) {
        if let Some(state) = self.idle.handle_signal(signal, now) {
            self.broadcast_idle(state);
        }
    }

    fn broadcast_idle(&mut self, state: UserIdleState) {
        if !self.status.is_collaborating {
            return;
        }
        let username = self.config.username.clone();
        log_send_error("idle state", self.portal.broadcast_idle_change(state, username));
    }

    /// The local user started or stopped following someone.
    pub fn on_user_follow(&mut self, payload: &UserFollowPayload) {
        log_send_error("follow", self.portal.broadcast_user_follow(payload));
    }

    /// The local viewport moved. Throttled; only relayed while someone follows us.
    pub fn on_viewport_change<H: DocumentHost>(&mut self, host: &H, now: Instant) {
        if self.viewport_queue.schedule((), now).is_some() {
            self.relay_visible_scene_bounds(host, false);
        }
    }

    fn relay_visible_scene_bounds<H: DocumentHost>(&mut self, host: &H, force: bool) {
        let Some(socket_id) = self.portal.socket_id().map(str::to_string) else {
            return;
        };
        let app_state = host.app_state();
        if app_state.followed_by.is_empty() && !force {
            return;
        }
        let room = RoomLinkData::follow_room(&socket_id);
        let username = self.config.username.clone();
        log_send_error(
            "viewport",
            self.portal
                .broadcast_visible_scene_bounds(app_state.visible_scene_bounds, username, &room),
        );
    }
}

fn reconcile_context<H: DocumentHost>(host: &H) -> ReconcileContext {
    ReconcileContext::editing(host.app_state().editing_element_ids)
}

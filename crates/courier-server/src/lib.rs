use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use courier_config::Config;
use courier_contracts::{
    column_letter, CallbackPayload, CallbackQuery, ErrorBody, ErrorResponse, InlineKeyboard,
    InlineKeyboardButton, Message, OrderRecord, OrderStatus, OutboundAction, Update, UpdateOutcome,
    User,
};
use courier_kernel::{
    assemble_record, catalog_lines, chat_binding, dedupe_venues, establishments_keyboard,
    filter_items, find_status_cell, is_employee, is_order_header, item_results_keyboard,
    line_items, lines_keyboard, match_venues, notification_text, sku_keyboard, summary_text,
    upsert_binding, venues_for, ConversationState, Session, VenueMatch,
};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

const MENU_TEXT: &str = "Commands:\n\
    /request — create a new request\n\
    /confirmed — list confirmed requests\n\
    /unconfirmed — list requests that are not confirmed yet\n\
    /all — list every request\n\
    /by_line <name> — requests for one catalog line\n\
    /by_amb <name> — requests from one agent";

const CHOOSE_LINE_TEXT: &str = "Choose a line (you can pick several) or press ✅ Finish selection.";
const CHOOSE_SKU_TEXT: &str = "Pick items in this line (you can pick several):";

const HTTP_TIMEOUT: StdDuration = StdDuration::from_secs(10);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    let sheets = if cfg.sheets.kind == "http" {
        SheetsBackend::Http(HttpSheets::new(&cfg)?)
    } else {
        SheetsBackend::Memory(MemorySheets::default())
    };
    let transport = if cfg.transport.kind == "http" {
        TransportBackend::Http(HttpTransport::new(&cfg)?)
    } else {
        TransportBackend::Memory(MemoryTransport::default())
    };
    Ok(build_app_with_backends(cfg, sheets, transport))
}

/// Same as [`build_app`] but with injected backends, so tests can seed the
/// in-memory sheet store and keep a handle on it.
pub fn build_app_with_backends(
    cfg: Config,
    sheets: SheetsBackend,
    transport: TransportBackend,
) -> Router {
    let state = AppState::new(cfg, sheets, transport);
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/updates", post(updates))
        .route("/v1/sync-venues", post(sync_venues))
        .with_state(state)
}

/// One-shot venue dedup/sync against the configured backends, for the
/// `sync-venues` subcommand.
pub async fn run_venue_sync(cfg: Config) -> Result<usize, String> {
    let sheets = if cfg.sheets.kind == "http" {
        SheetsBackend::Http(HttpSheets::new(&cfg)?)
    } else {
        SheetsBackend::Memory(MemorySheets::default())
    };
    let state = AppState::new(
        cfg,
        sheets,
        TransportBackend::Memory(MemoryTransport::default()),
    );
    state.sync_venues_once().await
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn updates(
    State(state): State<AppState>,
    Json(update): Json<Update>,
) -> Result<Json<UpdateOutcome>, (StatusCode, Json<ErrorResponse>)> {
    let update_id = update.update_id;
    match state.process_update(update).await {
        Ok(outcome) => {
            info!(update_id, actions = outcome.actions.len(), "update handled");
            Ok(Json(outcome))
        }
        Err(e) => {
            warn!(update_id, error = %e, "update rejected");
            Err((StatusCode::BAD_REQUEST, error_body("update_error", e)))
        }
    }
}

async fn sync_venues(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<ErrorResponse>)> {
    state
        .sync_venues_once()
        .await
        .map(|count| Json(json!({"venues": count})))
        .map_err(|e| (StatusCode::BAD_GATEWAY, error_body("sync_error", e)))
}

fn error_body(code: &str, message: String) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: ErrorBody {
            code: code.to_string(),
            message,
        },
    })
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    sheets: SheetsBackend,
    transport: TransportBackend,
    sessions: SessionStore,
}

impl AppState {
    fn new(cfg: Config, sheets: SheetsBackend, transport: TransportBackend) -> Self {
        Self {
            cfg,
            sheets,
            transport,
            sessions: SessionStore::default(),
        }
    }

    fn idle_timeout(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.cfg.session.idle_timeout_ms).unwrap_or(i64::MAX))
    }

    async fn process_update(&self, update: Update) -> Result<UpdateOutcome, String> {
        let mut outbox = Outbox::new(&self.transport);
        if let Some(message) = update.message {
            self.handle_message(message, &mut outbox).await?;
        } else if let Some(callback) = update.callback_query {
            self.handle_callback(callback, &mut outbox).await?;
        }
        Ok(UpdateOutcome {
            actions: outbox.actions,
        })
    }

    // -- reads that degrade to a safe fallback instead of failing the flow

    async fn read_or_empty(&self, sheet: &str) -> Vec<Vec<String>> {
        match self.sheets.read_rows(sheet).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(sheet, error = %e, "sheet read failed, degrading to empty");
                Vec::new()
            }
        }
    }

    async fn agent_venues(&self, handle: &str) -> Vec<String> {
        let rows = self.read_or_empty(&self.cfg.sheets.names.venues).await;
        venues_for(&rows, handle)
    }

    async fn employee(&self, handle: &str) -> bool {
        let rows = self.read_or_empty(&self.cfg.sheets.names.employees).await;
        is_employee(&rows, handle)
    }

    // -- inbound messages

    async fn handle_message(&self, message: Message, outbox: &mut Outbox<'_>) -> Result<(), String> {
        let Some(user) = message.from.clone() else {
            return Ok(());
        };
        let Some(text) = message.text.clone() else {
            return Ok(());
        };
        let text = text.trim().to_string();

        if message.chat.is_group() {
            if text == "/bind" || text.starts_with("/bind@") {
                self.handle_bind(&user, message.chat.id, outbox).await?;
            }
            // Everything else in groups is ignored on purpose.
            return Ok(());
        }
        if !message.chat.is_private() {
            return Ok(());
        }

        let key = (user.id, message.chat.id);
        self.expire_if_idle(key, message.chat.id, outbox).await?;

        match text.as_str() {
            "/start" => {
                outbox
                    .send(message.chat.id, &format!("Hi! {MENU_TEXT}"), None)
                    .await?;
                return Ok(());
            }
            "/request" => return self.start_request(&user, message.chat.id, outbox).await,
            "/confirmed" => {
                return self
                    .report(&user, message.chat.id, ReportFilter::Confirmed, outbox)
                    .await
            }
            "/unconfirmed" => {
                return self
                    .report(&user, message.chat.id, ReportFilter::Unconfirmed, outbox)
                    .await
            }
            "/all" => {
                return self
                    .report(&user, message.chat.id, ReportFilter::All, outbox)
                    .await
            }
            _ => {}
        }
        if let Some(arg) = command_argument(&text, "/by_line") {
            let Some(arg) = arg else {
                outbox
                    .send(message.chat.id, "Name a line. Example: /by_line Bliss", None)
                    .await?;
                return Ok(());
            };
            return self
                .report(&user, message.chat.id, ReportFilter::ByLine(arg), outbox)
                .await;
        }
        if let Some(arg) = command_argument(&text, "/by_amb") {
            let Some(arg) = arg else {
                outbox
                    .send(
                        message.chat.id,
                        "Name an agent. Example: /by_amb Alex Smith",
                        None,
                    )
                    .await?;
                return Ok(());
            };
            return self
                .report(&user, message.chat.id, ReportFilter::ByAgent(arg), outbox)
                .await;
        }

        let Some(mut session) = self.sessions.get(&key).await else {
            outbox.send(message.chat.id, MENU_TEXT, None).await?;
            return Ok(());
        };
        session.touch(Utc::now());

        match session.state {
            ConversationState::AwaitingEstablishment => {
                self.establishment_text(&user, message.chat.id, &text, session, outbox)
                    .await
            }
            ConversationState::AwaitingLine => {
                // Line picking is button-driven; free text here is ignored.
                self.sessions.put(key, session).await;
                Ok(())
            }
            ConversationState::AwaitingSku => {
                self.sessions.put(key, session.clone()).await;
                self.sku_search(message.chat.id, &text, &session, outbox).await
            }
            ConversationState::AwaitingPerson => {
                if text.is_empty() {
                    outbox
                        .send(message.chat.id, "Who did you talk to? Send a name.", None)
                        .await?;
                    self.sessions.put(key, session).await;
                    return Ok(());
                }
                session.person = Some(text);
                session.state = ConversationState::AwaitingContact;
                self.sessions.put(key, session).await;
                outbox
                    .send(
                        message.chat.id,
                        "Contact (phone or a profile link):",
                        None,
                    )
                    .await?;
                Ok(())
            }
            ConversationState::AwaitingContact => {
                self.sessions.put(key, session.clone()).await;
                self.finish_request(&user, message.chat.id, &text, &session, outbox)
                    .await
            }
        }
    }

    async fn expire_if_idle(
        &self,
        key: SessionKey,
        chat_id: i64,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        if let Some(session) = self.sessions.get(&key).await {
            if session.expired(Utc::now(), self.idle_timeout()) {
                self.sessions.delete(&key).await;
                outbox
                    .send(
                        chat_id,
                        "Your session expired. Start again with /request.",
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn start_request(
        &self,
        user: &User,
        chat_id: i64,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let Some(handle) = user.handle() else {
            outbox
                .send(
                    chat_id,
                    "You need a username to create requests. Set one and try again.",
                    None,
                )
                .await?;
            return Ok(());
        };
        if !self.employee(&handle).await {
            outbox
                .send(
                    chat_id,
                    "You're not allowed to create requests. Contact your manager.",
                    None,
                )
                .await?;
            return Ok(());
        }

        let session = Session::new(Utc::now());
        let venues = self.agent_venues(&handle).await;
        if venues.is_empty() {
            outbox.send(chat_id, "Venue name?", None).await?;
        } else {
            outbox
                .send(
                    chat_id,
                    "Choose a venue:",
                    Some(establishments_keyboard(&venues, 0)),
                )
                .await?;
        }
        self.sessions.put((user.id, chat_id), session).await;
        Ok(())
    }

    async fn establishment_text(
        &self,
        user: &User,
        chat_id: i64,
        text: &str,
        mut session: Session,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let key = (user.id, chat_id);
        let venues = match user.handle() {
            Some(handle) => self.agent_venues(&handle).await,
            None => Vec::new(),
        };

        if venues.is_empty() {
            // Free-text venue entry.
            if text.is_empty() {
                outbox.send(chat_id, "Venue name?", None).await?;
                self.sessions.put(key, session).await;
                return Ok(());
            }
            session.venue = Some(text.to_string());
            return self.enter_lines(chat_id, session, key, outbox).await;
        }

        match match_venues(&venues, text) {
            VenueMatch::None => {
                outbox
                    .send(chat_id, "Nothing found. Try a different query.", None)
                    .await?;
                self.sessions.put(key, session).await;
                Ok(())
            }
            VenueMatch::One(venue) => {
                session.venue = Some(venue);
                self.enter_lines(chat_id, session, key, outbox).await
            }
            VenueMatch::Many(matches) => {
                let keyboard = establishments_keyboard(&matches, 0);
                session.est_search = Some(matches);
                session.est_page = 0;
                self.sessions.put(key, session).await;
                outbox
                    .send(chat_id, "Several matches, pick one:", Some(keyboard))
                    .await?;
                Ok(())
            }
        }
    }

    /// Venue settled: move to line selection with a fresh lines keyboard.
    async fn enter_lines(
        &self,
        chat_id: i64,
        mut session: Session,
        key: SessionKey,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let catalog = self.read_or_empty(&self.cfg.sheets.names.catalog).await;
        let lines = catalog_lines(&catalog);
        session.state = ConversationState::AwaitingLine;
        session.active_line = None;
        session.est_search = None;
        self.sessions.put(key, session).await;
        outbox
            .send(chat_id, CHOOSE_LINE_TEXT, Some(lines_keyboard(&lines, true)))
            .await?;
        Ok(())
    }

    async fn sku_search(
        &self,
        chat_id: i64,
        query: &str,
        session: &Session,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        // The search never mutates the session; it only re-renders matches.
        let Some(line) = session.active_line else {
            outbox.send(chat_id, "Pick a line first.", None).await?;
            return Ok(());
        };
        if query.is_empty() {
            outbox
                .send(chat_id, "Type part of an item name.", None)
                .await?;
            return Ok(());
        }

        let catalog = self.read_or_empty(&self.cfg.sheets.names.catalog).await;
        if catalog.is_empty() {
            outbox
                .send(chat_id, "Cannot read the item list right now.", None)
                .await?;
            return Ok(());
        }
        let matches = filter_items(&line_items(&catalog, line), query);
        if matches.is_empty() {
            outbox
                .send(chat_id, "Nothing found. Try a different query.", None)
                .await?;
            return Ok(());
        }
        let selected = session.selections.selected(line);
        outbox
            .send(
                chat_id,
                "Found these items, pick the ones you need:",
                Some(item_results_keyboard(&matches, &selected)),
            )
            .await?;
        Ok(())
    }

    async fn finish_request(
        &self,
        user: &User,
        chat_id: i64,
        contact: &str,
        session: &Session,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let key = (user.id, chat_id);

        // Permission can change between start and finish; check again.
        let handle = match user.handle() {
            Some(handle) if self.employee(&handle).await => handle,
            _ => {
                self.sessions.delete(&key).await;
                outbox
                    .send(
                        chat_id,
                        "You're not allowed to create requests. Contact your manager.",
                        None,
                    )
                    .await?;
                return Ok(());
            }
        };

        let bindings = self.read_or_empty(&self.cfg.sheets.names.bindings).await;
        let Some(dest_chat) = chat_binding(&bindings, &handle) else {
            self.sessions.delete(&key).await;
            outbox
                .send(
                    chat_id,
                    "Error: no distributor chat is bound for you. Use /bind in the distributor group first.",
                    None,
                )
                .await?;
            return Ok(());
        };
        let Ok(dest_chat_id) = dest_chat.trim().parse::<i64>() else {
            self.sessions.delete(&key).await;
            outbox
                .send(chat_id, "Error: the bound chat id is invalid. Re-bind the distributor chat.", None)
                .await?;
            return Ok(());
        };

        // The session stays untouched on catalog/transport failures so the
        // final input can simply be sent again.
        let catalog = match self.sheets.read_rows(&self.cfg.sheets.names.catalog).await {
            Ok(rows) if !rows.is_empty() => rows,
            Ok(_) | Err(_) => {
                outbox
                    .send(chat_id, "Cannot read the catalog right now. Send the contact again in a moment.", None)
                    .await?;
                return Ok(());
            }
        };

        let mut record = assemble_record(
            Utc::now(),
            &user.display_name(),
            dest_chat.trim(),
            session.venue.as_deref().unwrap_or(""),
            session.person.as_deref().unwrap_or(""),
            contact,
            &catalog,
            &session.selections,
        );
        let summary = summary_text(&catalog, &session.selections);

        let notification = notification_text(&record, &summary);
        let token = match outbox
            .send(
                dest_chat_id,
                &notification,
                Some(confirm_keyboard()),
            )
            .await
        {
            Ok(message_id) => message_id,
            Err(e) => {
                warn!(error = %e, "notification send failed");
                outbox
                    .send(chat_id, "Could not deliver the request. Send the contact again in a moment.", None)
                    .await?;
                return Ok(());
            }
        };
        record.token = token.to_string();

        if let Err(e) = self
            .sheets
            .append_row(&self.cfg.sheets.names.orders, record.to_row())
            .await
        {
            warn!(error = %e, "order append failed");
            outbox
                .send(chat_id, "Could not record the request. Send the contact again in a moment.", None)
                .await?;
            return Ok(());
        }

        self.sessions.delete(&key).await;
        outbox
            .send(
                chat_id,
                &format!("Request recorded and routed.\n\n{MENU_TEXT}"),
                None,
            )
            .await?;
        Ok(())
    }

    async fn handle_bind(
        &self,
        user: &User,
        chat_id: i64,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let Some(handle) = user.handle() else {
            return Ok(());
        };
        if !self.employee(&handle).await {
            return Ok(());
        }

        let sheet = &self.cfg.sheets.names.bindings;
        let rows = self.read_or_empty(sheet).await;
        let rewritten = upsert_binding(&rows, &handle, chat_id);
        if let Err(e) = self.sheets.clear_and_write(sheet, rewritten).await {
            warn!(error = %e, "binding rewrite failed");
            outbox
                .send(chat_id, "Could not save the binding. Try again.", None)
                .await?;
            return Ok(());
        }
        outbox
            .send(
                chat_id,
                &format!("Chat bound to {handle}. Requests will be delivered here."),
                None,
            )
            .await?;
        Ok(())
    }

    async fn report(
        &self,
        user: &User,
        chat_id: i64,
        filter: ReportFilter,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let authorized = match user.handle() {
            Some(handle) => self.employee(&handle).await,
            None => false,
        };
        if !authorized {
            return Ok(());
        }

        let rows = self.read_or_empty(&self.cfg.sheets.names.orders).await;
        let records: Vec<OrderRecord> = rows
            .iter()
            .filter(|row| !is_order_header(row))
            .filter_map(|row| OrderRecord::from_row(row))
            .collect();

        let text = match &filter {
            ReportFilter::Confirmed => render_report(
                records
                    .iter()
                    .filter(|record| record.status == OrderStatus::Confirmed),
                "Confirmed requests:",
                "No confirmed requests.",
            ),
            // "Unconfirmed" covers both pending and rejected rows.
            ReportFilter::Unconfirmed => render_report(
                records
                    .iter()
                    .filter(|record| record.status != OrderStatus::Confirmed),
                "Requests awaiting confirmation:",
                "All requests are confirmed.",
            ),
            ReportFilter::All => render_report(records.iter(), "All requests:", "No requests."),
            ReportFilter::ByAgent(name) => render_report(
                records
                    .iter()
                    .filter(|record| record.agent_name.trim().eq_ignore_ascii_case(name.trim())),
                &format!("Requests from {name}:"),
                "No requests from that agent.",
            ),
            ReportFilter::ByLine(name) => {
                // Record line cells follow the catalog header order, so the
                // line name resolves to a slot among the non-empty headers.
                let catalog = self.read_or_empty(&self.cfg.sheets.names.catalog).await;
                let slot = catalog_lines(&catalog)
                    .iter()
                    .position(|(_, line)| line.eq_ignore_ascii_case(name.trim()));
                let entries: Vec<String> = slot
                    .map(|slot| {
                        records
                            .iter()
                            .filter_map(|record| {
                                let items = record.lines.get(slot)?;
                                if items.is_empty() {
                                    return None;
                                }
                                Some(format!(
                                    "{} | {} | {} | {}",
                                    record.venue,
                                    items,
                                    record.contact,
                                    status_label(&record.status)
                                ))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                if entries.is_empty() {
                    "No requests for that line.".to_string()
                } else {
                    format!("Requests for line {name}:\n\n{}", entries.join("\n"))
                }
            }
        };
        outbox.send(chat_id, &text, None).await?;
        Ok(())
    }

    // -- inbound callback actions

    async fn handle_callback(
        &self,
        callback: CallbackQuery,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let payload = callback.data.as_deref().and_then(CallbackPayload::parse);
        let Some(payload) = payload else {
            outbox.answer(&callback.id, None, false).await?;
            return Ok(());
        };

        match &payload {
            CallbackPayload::Confirm { token } => {
                return self
                    .set_status(&callback, token.clone(), OrderStatus::Confirmed, outbox)
                    .await;
            }
            CallbackPayload::Reject { token } => {
                return self
                    .set_status(&callback, token.clone(), OrderStatus::Rejected, outbox)
                    .await;
            }
            _ => {}
        }

        let Some(message) = callback.message.clone() else {
            outbox.answer(&callback.id, None, false).await?;
            return Ok(());
        };
        let chat_id = message.chat.id;
        let key = (callback.from.id, chat_id);

        let Some(mut session) = self.sessions.get(&key).await else {
            outbox
                .answer(&callback.id, Some("Start with /request."), false)
                .await?;
            return Ok(());
        };
        if session.expired(Utc::now(), self.idle_timeout()) {
            self.sessions.delete(&key).await;
            outbox
                .answer(
                    &callback.id,
                    Some("Your session expired. Start again with /request."),
                    true,
                )
                .await?;
            return Ok(());
        }
        session.touch(Utc::now());

        match payload {
            CallbackPayload::Establishment(venue) => {
                if session.state != ConversationState::AwaitingEstablishment {
                    self.sessions.put(key, session).await;
                    outbox.answer(&callback.id, None, false).await?;
                    return Ok(());
                }
                session.venue = Some(venue);
                session.selections = Default::default();
                let catalog = self.read_or_empty(&self.cfg.sheets.names.catalog).await;
                let lines = catalog_lines(&catalog);
                session.state = ConversationState::AwaitingLine;
                session.est_search = None;
                self.sessions.put(key, session).await;
                outbox
                    .edit_text(
                        chat_id,
                        message.message_id,
                        CHOOSE_LINE_TEXT,
                        Some(lines_keyboard(&lines, true)),
                    )
                    .await?;
                outbox.answer(&callback.id, None, false).await?;
            }
            CallbackPayload::EstablishmentPage(page) => {
                let venues = match &session.est_search {
                    Some(matches) => matches.clone(),
                    None => match callback.from.handle() {
                        Some(handle) => self.agent_venues(&handle).await,
                        None => Vec::new(),
                    },
                };
                session.est_page = page;
                self.sessions.put(key, session).await;
                outbox
                    .edit_markup(
                        chat_id,
                        message.message_id,
                        establishments_keyboard(&venues, page),
                    )
                    .await?;
                outbox.answer(&callback.id, None, false).await?;
            }
            CallbackPayload::Line(line) => {
                if session.state != ConversationState::AwaitingLine {
                    self.sessions.put(key, session).await;
                    outbox.answer(&callback.id, None, false).await?;
                    return Ok(());
                }
                let catalog = self.read_or_empty(&self.cfg.sheets.names.catalog).await;
                let items = line_items(&catalog, line);
                let selected = session.selections.selected(line);
                session.active_line = Some(line);
                session.state = ConversationState::AwaitingSku;
                self.sessions.put(key, session).await;
                outbox
                    .edit_text(
                        chat_id,
                        message.message_id,
                        CHOOSE_SKU_TEXT,
                        Some(sku_keyboard(&items, &selected)),
                    )
                    .await?;
                outbox.answer(&callback.id, None, false).await?;
            }
            CallbackPayload::LinesDone => {
                if session.state != ConversationState::AwaitingLine {
                    self.sessions.put(key, session).await;
                    outbox.answer(&callback.id, None, false).await?;
                    return Ok(());
                }
                if session.selections.is_empty() {
                    self.sessions.put(key, session).await;
                    outbox
                        .answer(&callback.id, Some("You haven't picked any items yet."), true)
                        .await?;
                    return Ok(());
                }
                session.state = ConversationState::AwaitingPerson;
                self.sessions.put(key, session).await;
                outbox
                    .edit_text(
                        chat_id,
                        message.message_id,
                        "Who did you talk to? Send a name.",
                        None,
                    )
                    .await?;
                outbox.answer(&callback.id, None, false).await?;
            }
            CallbackPayload::Sku(item) => {
                let Some(line) = session.active_line else {
                    self.sessions.put(key, session).await;
                    outbox
                        .answer(&callback.id, Some("Pick a line first."), false)
                        .await?;
                    return Ok(());
                };
                session.selections.toggle(line, &item);
                let selected = session.selections.selected(line);
                self.sessions.put(key, session).await;
                let catalog = self.read_or_empty(&self.cfg.sheets.names.catalog).await;
                let items = line_items(&catalog, line);
                outbox
                    .edit_markup(
                        chat_id,
                        message.message_id,
                        sku_keyboard(&items, &selected),
                    )
                    .await?;
                outbox.answer(&callback.id, None, false).await?;
            }
            CallbackPayload::SkuDone | CallbackPayload::SkuBack => {
                if session.active_line.is_none()
                    && session.state != ConversationState::AwaitingSku
                {
                    self.sessions.put(key, session).await;
                    outbox
                        .answer(&callback.id, Some("Pick a line first."), true)
                        .await?;
                    return Ok(());
                }
                session.active_line = None;
                session.state = ConversationState::AwaitingLine;
                self.sessions.put(key, session).await;
                let catalog = self.read_or_empty(&self.cfg.sheets.names.catalog).await;
                let lines = catalog_lines(&catalog);
                outbox
                    .edit_text(
                        chat_id,
                        message.message_id,
                        CHOOSE_LINE_TEXT,
                        Some(lines_keyboard(&lines, true)),
                    )
                    .await?;
                outbox.answer(&callback.id, None, false).await?;
            }
            // Handled before the session lookup.
            CallbackPayload::Confirm { .. } | CallbackPayload::Reject { .. } => {}
        }
        Ok(())
    }

    /// Status round-trip: resolve the correlation token from the callback
    /// payload (legacy tokened form) or the notification message itself,
    /// then rewrite the matched row's status cell.
    async fn set_status(
        &self,
        callback: &CallbackQuery,
        payload_token: Option<String>,
        status: OrderStatus,
        outbox: &mut Outbox<'_>,
    ) -> Result<(), String> {
        let token = payload_token.or_else(|| {
            callback
                .message
                .as_ref()
                .map(|m| m.message_id.to_string())
        });
        let Some(token) = token else {
            outbox.answer(&callback.id, Some("Not found."), true).await?;
            return Ok(());
        };

        let sheet = &self.cfg.sheets.names.orders;
        let rows = match self.sheets.read_rows(sheet).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "orders read failed during status update");
                outbox
                    .answer(&callback.id, Some("Not found. Try again later."), true)
                    .await?;
                return Ok(());
            }
        };

        let Some((row_index, status_col)) = find_status_cell(&rows, &token) else {
            outbox.answer(&callback.id, Some("Not found."), true).await?;
            return Ok(());
        };

        if let Err(e) = self
            .sheets
            .update_cell(sheet, row_index, &column_letter(status_col), status.cell_value())
            .await
        {
            warn!(error = %e, "status cell update failed");
            outbox
                .answer(&callback.id, Some("Update failed. Try again."), true)
                .await?;
            return Ok(());
        }

        let (ack, suffix) = match status {
            OrderStatus::Rejected => ("Marked as not shipped.", "❌ Not shipped"),
            _ => ("Confirmed.", "✅ Confirmed"),
        };
        outbox.answer(&callback.id, Some(ack), false).await?;
        if let Some(message) = &callback.message {
            let base = message.text.clone().unwrap_or_default();
            outbox
                .edit_text(
                    message.chat.id,
                    message.message_id,
                    &format!("{base}\n\n{suffix}"),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    async fn sync_venues_once(&self) -> Result<usize, String> {
        let source = self
            .sheets
            .read_source_rows(&self.cfg.sheets.names.venue_source)
            .await?;
        let rows = dedupe_venues(&source);
        let count = rows.len().saturating_sub(1);
        self.sheets
            .clear_and_write(&self.cfg.sheets.names.venues, rows)
            .await?;
        info!(venues = count, "venue sync completed");
        Ok(count)
    }
}

enum ReportFilter {
    Confirmed,
    Unconfirmed,
    All,
    ByLine(String),
    ByAgent(String),
}

/// Splits `/cmd rest` into its argument. Outer `None` when the text is not
/// this command, inner `None` when the argument is missing.
fn command_argument(text: &str, command: &str) -> Option<Option<String>> {
    let rest = text.strip_prefix(command)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let arg = rest.trim();
    if arg.is_empty() {
        Some(None)
    } else {
        Some(Some(arg.to_string()))
    }
}

fn status_label(status: &OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Confirmed => "confirmed",
        OrderStatus::Rejected => "rejected",
    }
}

fn render_report<'a, I>(records: I, title: &str, empty: &str) -> String
where
    I: Iterator<Item = &'a OrderRecord>,
{
    let entries: Vec<String> = records
        .map(|record| {
            format!(
                "{} | {} | {} | {}",
                record.venue,
                record.person,
                record.contact,
                status_label(&record.status)
            )
        })
        .collect();
    if entries.is_empty() {
        empty.to_string()
    } else {
        format!("{title}\n\n{}", entries.join("\n"))
    }
}

fn confirm_keyboard() -> InlineKeyboard {
    InlineKeyboard {
        inline_keyboard: vec![vec![
            InlineKeyboardButton::new("✅ Confirmed", CallbackPayload::Confirm { token: None }.encode()),
            InlineKeyboardButton::new("❌ Not shipped", CallbackPayload::Reject { token: None }.encode()),
        ]],
    }
}

/// Executes outbound transport calls and records them in order; the record
/// becomes the webhook response body.
struct Outbox<'a> {
    transport: &'a TransportBackend,
    actions: Vec<OutboundAction>,
}

impl<'a> Outbox<'a> {
    fn new(transport: &'a TransportBackend) -> Self {
        Self {
            transport,
            actions: Vec::new(),
        }
    }

    async fn send(
        &mut self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<i64, String> {
        let message_id = self
            .transport
            .send_message(chat_id, text, reply_markup.clone())
            .await?;
        self.actions.push(OutboundAction::SendMessage {
            chat_id,
            text: text.to_string(),
            reply_markup,
        });
        Ok(message_id)
    }

    async fn edit_text(
        &mut self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<(), String> {
        self.transport
            .edit_message_text(chat_id, message_id, text, reply_markup.clone())
            .await?;
        self.actions.push(OutboundAction::EditMessageText {
            chat_id,
            message_id,
            text: text.to_string(),
            reply_markup,
        });
        Ok(())
    }

    async fn edit_markup(
        &mut self,
        chat_id: i64,
        message_id: i64,
        reply_markup: InlineKeyboard,
    ) -> Result<(), String> {
        self.transport
            .edit_reply_markup(chat_id, message_id, reply_markup.clone())
            .await?;
        self.actions.push(OutboundAction::EditReplyMarkup {
            chat_id,
            message_id,
            reply_markup,
        });
        Ok(())
    }

    async fn answer(
        &mut self,
        callback_query_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<(), String> {
        self.transport
            .answer_callback(callback_query_id, text, show_alert)
            .await?;
        self.actions.push(OutboundAction::AnswerCallback {
            callback_query_id: callback_query_id.to_string(),
            text: text.map(|v| v.to_string()),
            show_alert,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session store

type SessionKey = (i64, i64);

/// Injected per-(agent, chat) session map with explicit create/read/delete,
/// replacing the ambient globals of older deployments.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<HashMap<SessionKey, Session>>>,
}

impl SessionStore {
    async fn get(&self, key: &SessionKey) -> Option<Session> {
        self.inner.lock().await.get(key).cloned()
    }

    async fn put(&self, key: SessionKey, session: Session) {
        self.inner.lock().await.insert(key, session);
    }

    async fn delete(&self, key: &SessionKey) {
        self.inner.lock().await.remove(key);
    }
}

// ---------------------------------------------------------------------------
// Sheet store backends

#[derive(Clone)]
pub enum SheetsBackend {
    Memory(MemorySheets),
    Http(HttpSheets),
}

impl SheetsBackend {
    async fn read_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, String> {
        match self {
            SheetsBackend::Memory(store) => Ok(store.rows(sheet).await),
            SheetsBackend::Http(store) => store.read_rows(sheet, false).await,
        }
    }

    async fn read_source_rows(&self, sheet: &str) -> Result<Vec<Vec<String>>, String> {
        match self {
            SheetsBackend::Memory(store) => Ok(store.rows(&MemorySheets::source_key(sheet)).await),
            SheetsBackend::Http(store) => store.read_rows(sheet, true).await,
        }
    }

    async fn append_row(&self, sheet: &str, values: Vec<String>) -> Result<(), String> {
        match self {
            SheetsBackend::Memory(store) => {
                store.inner.lock().await.entry(sheet.to_string()).or_default().push(values);
                Ok(())
            }
            SheetsBackend::Http(store) => store.append_row(sheet, values).await,
        }
    }

    async fn update_cell(
        &self,
        sheet: &str,
        row_index: usize,
        column_letter: &str,
        value: &str,
    ) -> Result<(), String> {
        match self {
            SheetsBackend::Memory(store) => store.update_cell(sheet, row_index, column_letter, value).await,
            SheetsBackend::Http(store) => store.update_cell(sheet, row_index, column_letter, value).await,
        }
    }

    async fn clear_and_write(&self, sheet: &str, rows: Vec<Vec<String>>) -> Result<(), String> {
        match self {
            SheetsBackend::Memory(store) => {
                store.inner.lock().await.insert(sheet.to_string(), rows);
                Ok(())
            }
            SheetsBackend::Http(store) => store.clear_and_write(sheet, rows).await,
        }
    }
}

/// Clone-shared in-memory sheet store; tests seed it before building the
/// app and inspect it afterwards through the same handle.
#[derive(Clone, Default)]
pub struct MemorySheets {
    inner: Arc<Mutex<HashMap<String, Vec<Vec<String>>>>>,
}

impl MemorySheets {
    fn source_key(sheet: &str) -> String {
        format!("source/{sheet}")
    }

    pub async fn seed(&self, sheet: &str, rows: Vec<Vec<String>>) {
        self.inner.lock().await.insert(sheet.to_string(), rows);
    }

    /// Seeds a sheet of the *source* spreadsheet used by the venue sync.
    pub async fn seed_source(&self, sheet: &str, rows: Vec<Vec<String>>) {
        self.seed(&Self::source_key(sheet), rows).await;
    }

    pub async fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.inner.lock().await.get(sheet).cloned().unwrap_or_default()
    }

    async fn update_cell(
        &self,
        sheet: &str,
        row_index: usize,
        column_letter: &str,
        value: &str,
    ) -> Result<(), String> {
        let col = letter_to_index(column_letter)?;
        let mut sheets = self.inner.lock().await;
        let rows = sheets
            .get_mut(sheet)
            .ok_or_else(|| format!("unknown sheet: {sheet}"))?;
        let row = rows
            .get_mut(row_index.checked_sub(1).ok_or("row_index must be >= 1")?)
            .ok_or_else(|| format!("row {row_index} out of range"))?;
        if row.len() <= col {
            row.resize(col + 1, String::new());
        }
        row[col] = value.to_string();
        Ok(())
    }
}

fn letter_to_index(letters: &str) -> Result<usize, String> {
    if letters.is_empty() {
        return Err("empty column letter".to_string());
    }
    let mut index = 0usize;
    for ch in letters.chars() {
        if !ch.is_ascii_uppercase() {
            return Err(format!("invalid column letter: {letters}"));
        }
        index = index * 26 + (ch as usize - 'A' as usize + 1);
    }
    Ok(index - 1)
}

#[derive(Clone)]
pub struct HttpSheets {
    client: Client,
    api_base: String,
    spreadsheet_id: String,
    source_spreadsheet_id: Option<String>,
    bearer_token: String,
}

impl HttpSheets {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_base: required(&cfg.sheets.api_base, "sheets.api_base")?,
            spreadsheet_id: required(&cfg.sheets.spreadsheet_id, "sheets.spreadsheet_id")?,
            source_spreadsheet_id: cfg.sheets.source_spreadsheet_id.clone(),
            bearer_token: required(&cfg.sheets.bearer_token, "sheets.bearer_token")?,
        })
    }

    fn spreadsheet(&self, source: bool) -> Result<&str, String> {
        if source {
            self.source_spreadsheet_id
                .as_deref()
                .ok_or_else(|| "sheets.source_spreadsheet_id is not configured".to_string())
        } else {
            Ok(&self.spreadsheet_id)
        }
    }

    async fn read_rows(&self, sheet: &str, source: bool) -> Result<Vec<Vec<String>>, String> {
        let id = self.spreadsheet(source)?;
        let url = format!("{}/{id}/values/{sheet}!A1:Z9999", self.api_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| format!("sheet read transport error: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("sheet read failed: HTTP {}", response.status()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("sheet read parse error: {e}"))?;
        let values = body
            .get("values")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| {
                                cells
                                    .iter()
                                    .map(|cell| match cell {
                                        Value::String(s) => s.clone(),
                                        other => other.to_string(),
                                    })
                                    .collect()
                            })
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(values)
    }

    async fn append_row(&self, sheet: &str, values: Vec<String>) -> Result<(), String> {
        let url = format!(
            "{}/{}/values/{sheet}!A1:append?valueInputOption=USER_ENTERED",
            self.api_base, self.spreadsheet_id
        );
        self.post_values(&url, json!({"values": [values]})).await
    }

    async fn update_cell(
        &self,
        sheet: &str,
        row_index: usize,
        column_letter: &str,
        value: &str,
    ) -> Result<(), String> {
        let url = format!(
            "{}/{}/values/{sheet}!{column_letter}{row_index}?valueInputOption=RAW",
            self.api_base, self.spreadsheet_id
        );
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.bearer_token)
            .json(&json!({"values": [[value]]}))
            .send()
            .await
            .map_err(|e| format!("sheet update transport error: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("sheet update failed: HTTP {}", response.status()));
        }
        Ok(())
    }

    async fn clear_and_write(&self, sheet: &str, rows: Vec<Vec<String>>) -> Result<(), String> {
        let clear_url = format!(
            "{}/{}/values/{sheet}!A1:Z9999:clear",
            self.api_base, self.spreadsheet_id
        );
        self.post_values(&clear_url, json!({})).await?;

        let write_url = format!(
            "{}/{}/values/{sheet}!A1?valueInputOption=RAW",
            self.api_base, self.spreadsheet_id
        );
        let response = self
            .client
            .put(&write_url)
            .bearer_auth(&self.bearer_token)
            .json(&json!({"values": rows}))
            .send()
            .await
            .map_err(|e| format!("sheet write transport error: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("sheet write failed: HTTP {}", response.status()));
        }
        Ok(())
    }

    async fn post_values(&self, url: &str, body: Value) -> Result<(), String> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.bearer_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("sheet call transport error: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("sheet call failed: HTTP {}", response.status()));
        }
        Ok(())
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String, String> {
    value
        .as_deref()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| format!("{field} is required"))
}

// ---------------------------------------------------------------------------
// Chat transport backends

#[derive(Clone)]
pub enum TransportBackend {
    Memory(MemoryTransport),
    Http(HttpTransport),
}

impl TransportBackend {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<i64, String> {
        match self {
            TransportBackend::Memory(transport) => transport.send_message(chat_id).await,
            TransportBackend::Http(transport) => {
                transport.send_message(chat_id, text, reply_markup).await
            }
        }
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<(), String> {
        match self {
            TransportBackend::Memory(_) => Ok(()),
            TransportBackend::Http(transport) => {
                transport
                    .edit_message_text(chat_id, message_id, text, reply_markup)
                    .await
            }
        }
    }

    async fn edit_reply_markup(
        &self,
        chat_id: i64,
        message_id: i64,
        reply_markup: InlineKeyboard,
    ) -> Result<(), String> {
        match self {
            TransportBackend::Memory(_) => Ok(()),
            TransportBackend::Http(transport) => {
                transport.edit_reply_markup(chat_id, message_id, reply_markup).await
            }
        }
    }

    async fn answer_callback(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<(), String> {
        match self {
            TransportBackend::Memory(_) => Ok(()),
            TransportBackend::Http(transport) => {
                transport
                    .answer_callback(callback_query_id, text, show_alert)
                    .await
            }
        }
    }
}

/// Allocates message ids without delivering anything; outbound traffic is
/// observable through the webhook outcome, so nothing else is recorded.
/// A chat can be marked unreachable to exercise delivery-failure handling.
#[derive(Clone)]
pub struct MemoryTransport {
    next_id: Arc<Mutex<i64>>,
    unreachable_chat: Arc<Mutex<Option<i64>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            next_id: Arc::new(Mutex::new(1000)),
            unreachable_chat: Arc::new(Mutex::new(None)),
        }
    }
}

impl MemoryTransport {
    pub async fn mark_unreachable(&self, chat_id: i64) {
        *self.unreachable_chat.lock().await = Some(chat_id);
    }

    pub async fn clear_unreachable(&self) {
        *self.unreachable_chat.lock().await = None;
    }

    async fn send_message(&self, chat_id: i64) -> Result<i64, String> {
        if *self.unreachable_chat.lock().await == Some(chat_id) {
            return Err(format!("chat {chat_id} is unreachable"));
        }
        let mut next = self.next_id.lock().await;
        let id = *next;
        *next += 1;
        Ok(id)
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl HttpTransport {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_base: required(&cfg.transport.api_base, "transport.api_base")?,
            bot_token: required(&cfg.transport.bot_token, "transport.bot_token")?,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, String> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("{method} transport error: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("{method} failed: HTTP {}", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| format!("{method} parse error: {e}"))
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<i64, String> {
        let mut body = json!({"chat_id": chat_id, "text": text});
        if let Some(markup) = reply_markup {
            body["reply_markup"] = serde_json::to_value(markup).map_err(|e| e.to_string())?;
        }
        let reply = self.call("sendMessage", body).await?;
        reply
            .pointer("/result/message_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| "sendMessage reply missing result.message_id".to_string())
    }

    async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<(), String> {
        let mut body = json!({"chat_id": chat_id, "message_id": message_id, "text": text});
        if let Some(markup) = reply_markup {
            body["reply_markup"] = serde_json::to_value(markup).map_err(|e| e.to_string())?;
        }
        self.call("editMessageText", body).await.map(|_| ())
    }

    async fn edit_reply_markup(
        &self,
        chat_id: i64,
        message_id: i64,
        reply_markup: InlineKeyboard,
    ) -> Result<(), String> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reply_markup": serde_json::to_value(reply_markup).map_err(|e| e.to_string())?,
        });
        self.call("editMessageReplyMarkup", body).await.map(|_| ())
    }

    async fn answer_callback(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<(), String> {
        let mut body = json!({"callback_query_id": callback_query_id, "show_alert": show_alert});
        if let Some(text) = text {
            body["text"] = Value::String(text.to_string());
        }
        self.call("answerCallbackQuery", body).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_map_back_to_indexes() {
        assert_eq!(letter_to_index("A").unwrap(), 0);
        assert_eq!(letter_to_index("I").unwrap(), 8);
        assert_eq!(letter_to_index("Z").unwrap(), 25);
        assert_eq!(letter_to_index("AA").unwrap(), 26);
        assert!(letter_to_index("").is_err());
        assert!(letter_to_index("a1").is_err());
    }

    #[tokio::test]
    async fn memory_update_cell_extends_short_rows() {
        let store = MemorySheets::default();
        store
            .seed("Requests", vec![vec!["x".to_string(), "y".to_string()]])
            .await;
        store.update_cell("Requests", 1, "D", "v").await.unwrap();
        let rows = store.rows("Requests").await;
        assert_eq!(rows[0], vec!["x", "y", "", "v"]);
        assert!(store.update_cell("Requests", 2, "A", "v").await.is_err());
        assert!(store.update_cell("Missing", 1, "A", "v").await.is_err());
    }
}

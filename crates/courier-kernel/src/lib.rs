use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use courier_contracts::{
    status_column, CallbackPayload, InlineKeyboard, InlineKeyboardButton, OrderRecord, OrderStatus,
};

pub const ESTABLISHMENT_PAGE_SIZE: usize = 10;

/// Button labels are cut to this many characters. Selection and callback
/// payloads always carry the full item name; the truncation is display-only,
/// so two items sharing a 20-character prefix still select independently.
pub const DISPLAY_KEY_LEN: usize = 20;

// Column offsets of the live form sheet the venue sync reads from.
const SOURCE_HANDLE_COL: usize = 1;
const SOURCE_VENUE_COL: usize = 3;
const SOURCE_ADDRESS_COL: usize = 4;

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn display_key(name: &str) -> String {
    name.chars().take(DISPLAY_KEY_LEN).collect()
}

// ---------------------------------------------------------------------------
// Catalog

/// Lines defined by the catalog header row: `(column index, trimmed name)`
/// for every non-empty header cell, in column order. The column index is the
/// line identifier for the rest of the workflow.
pub fn catalog_lines(rows: &[Vec<String>]) -> Vec<(usize, String)> {
    let header = match rows.first() {
        Some(v) => v,
        None => return Vec::new(),
    };
    header
        .iter()
        .enumerate()
        .filter_map(|(idx, cell)| {
            let name = cell.trim();
            if name.is_empty() {
                None
            } else {
                Some((idx, name.to_string()))
            }
        })
        .collect()
}

/// Every non-empty body cell of the given column, in row order, full names.
pub fn line_items(rows: &[Vec<String>], col: usize) -> Vec<String> {
    rows.iter()
        .skip(1)
        .filter_map(|row| row.get(col))
        .map(|cell| cell.trim())
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .collect()
}

pub fn filter_items(items: &[String], query: &str) -> Vec<String> {
    contains_ci(items, query)
}

fn contains_ci(names: &[String], query: &str) -> Vec<String> {
    let needle = query.trim().to_lowercase();
    names
        .iter()
        .filter(|name| name.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Venues, bindings, allow-list

/// Venue display names owned by the given agent handle, in sheet row order.
/// An empty result is the signal for the free-text entry path.
pub fn venues_for(rows: &[Vec<String>], handle: &str) -> Vec<String> {
    rows.iter()
        .skip(1)
        .filter(|row| row.len() >= 2)
        .filter(|row| row[0].trim().eq_ignore_ascii_case(handle.trim()))
        .map(|row| row[1].clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueMatch {
    None,
    One(String),
    Many(Vec<String>),
}

pub fn match_venues(venues: &[String], query: &str) -> VenueMatch {
    let mut matched = contains_ci(venues, query);
    match matched.len() {
        0 => VenueMatch::None,
        1 => VenueMatch::One(matched.remove(0)),
        _ => VenueMatch::Many(matched),
    }
}

pub fn chat_binding(rows: &[Vec<String>], handle: &str) -> Option<String> {
    rows.iter()
        .skip(1)
        .find(|row| row.len() >= 2 && row[0].trim().eq_ignore_ascii_case(handle.trim()))
        .map(|row| row[1].clone())
}

/// Full rewrite of the bindings sheet with the handle bound to `chat_id`.
/// A later bind overwrites the previous one; at most one row per handle.
pub fn upsert_binding(rows: &[Vec<String>], handle: &str, chat_id: i64) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = if rows.is_empty() {
        vec![vec![
            "ambassador_username".to_string(),
            "chat_id".to_string(),
        ]]
    } else {
        rows.to_vec()
    };

    let replacement = vec![handle.to_string(), chat_id.to_string()];
    let mut replaced = false;
    for row in out.iter_mut().skip(1) {
        if !row.is_empty() && row[0].trim().eq_ignore_ascii_case(handle.trim()) {
            *row = replacement.clone();
            replaced = true;
        }
    }
    if !replaced {
        out.push(replacement);
    }
    out
}

pub fn is_employee(rows: &[Vec<String>], handle: &str) -> bool {
    rows.iter()
        .skip(1)
        .any(|row| !row.is_empty() && row[0].trim().eq_ignore_ascii_case(handle.trim()))
}

// ---------------------------------------------------------------------------
// Selection set

/// Per-conversation multi-select state: line index -> chosen item names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionMap {
    by_line: BTreeMap<usize, BTreeSet<String>>,
}

impl SelectionMap {
    /// Flips the item's membership in the line's set and reports whether it
    /// is selected afterwards. Toggling twice restores the original state.
    pub fn toggle(&mut self, line: usize, item: &str) -> bool {
        let set = self.by_line.entry(line).or_default();
        if set.remove(item) {
            false
        } else {
            set.insert(item.to_string());
            true
        }
    }

    pub fn selected(&self, line: usize) -> BTreeSet<String> {
        self.by_line.get(&line).cloned().unwrap_or_default()
    }

    pub fn is_selected(&self, line: usize, item: &str) -> bool {
        self.by_line
            .get(&line)
            .map(|set| set.contains(item))
            .unwrap_or(false)
    }

    /// True when no item is selected in any line (union across lines).
    pub fn is_empty(&self) -> bool {
        self.by_line.values().all(|set| set.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Conversation session

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    AwaitingEstablishment,
    AwaitingLine,
    AwaitingSku,
    AwaitingPerson,
    AwaitingContact,
}

/// Ephemeral per-(agent, chat) capture state. Idle and Completed are the
/// absence of a session; creation is the start trigger and deletion is
/// completion, rejection, or idle expiry.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: ConversationState,
    pub venue: Option<String>,
    pub selections: SelectionMap,
    pub active_line: Option<usize>,
    pub person: Option<String>,
    pub est_search: Option<Vec<String>>,
    pub est_page: usize,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: ConversationState::AwaitingEstablishment,
            venue: None,
            selections: SelectionMap::default(),
            active_line: None,
            person: None,
            est_search: None,
            est_page: 0,
            last_activity: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn expired(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        now - self.last_activity > idle_timeout
    }
}

// ---------------------------------------------------------------------------
// Keyboards

pub fn establishments_keyboard(venues: &[String], page: usize) -> InlineKeyboard {
    let start = page * ESTABLISHMENT_PAGE_SIZE;
    let end = (start + ESTABLISHMENT_PAGE_SIZE).min(venues.len());
    let mut rows: Vec<Vec<InlineKeyboardButton>> = venues
        .get(start..end)
        .unwrap_or_default()
        .iter()
        .map(|name| {
            vec![InlineKeyboardButton::new(
                name.clone(),
                CallbackPayload::Establishment(name.clone()).encode(),
            )]
        })
        .collect();

    let mut nav = Vec::new();
    if page > 0 {
        nav.push(InlineKeyboardButton::new(
            "⏮ Back",
            CallbackPayload::EstablishmentPage(page - 1).encode(),
        ));
    }
    if end < venues.len() {
        nav.push(InlineKeyboardButton::new(
            "Next ⏭",
            CallbackPayload::EstablishmentPage(page + 1).encode(),
        ));
    }
    if !nav.is_empty() {
        rows.push(nav);
    }
    InlineKeyboard {
        inline_keyboard: rows,
    }
}

pub fn lines_keyboard(lines: &[(usize, String)], add_done: bool) -> InlineKeyboard {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = lines
        .iter()
        .map(|(idx, name)| {
            vec![InlineKeyboardButton::new(
                name.clone(),
                CallbackPayload::Line(*idx).encode(),
            )]
        })
        .collect();
    if add_done && !rows.is_empty() {
        rows.push(vec![InlineKeyboardButton::new(
            "✅ Finish selection",
            CallbackPayload::LinesDone.encode(),
        )]);
    }
    InlineKeyboard {
        inline_keyboard: rows,
    }
}

fn sku_buttons(items: &[String], selected: &BTreeSet<String>) -> Vec<Vec<InlineKeyboardButton>> {
    items
        .iter()
        .map(|name| {
            let label = if selected.contains(name) {
                format!("✅ {}", display_key(name))
            } else {
                display_key(name)
            };
            vec![InlineKeyboardButton::new(
                label,
                CallbackPayload::Sku(name.clone()).encode(),
            )]
        })
        .collect()
}

pub fn sku_keyboard(items: &[String], selected: &BTreeSet<String>) -> InlineKeyboard {
    let mut rows = sku_buttons(items, selected);
    rows.push(vec![InlineKeyboardButton::new(
        "✅ Done with this line",
        CallbackPayload::SkuDone.encode(),
    )]);
    rows.push(vec![InlineKeyboardButton::new(
        "⬅ Back to lines",
        CallbackPayload::SkuBack.encode(),
    )]);
    InlineKeyboard {
        inline_keyboard: rows,
    }
}

/// Keyboard for a filtered item search: the matches with their current
/// marks plus the back row.
pub fn item_results_keyboard(matches: &[String], selected: &BTreeSet<String>) -> InlineKeyboard {
    let mut rows = sku_buttons(matches, selected);
    rows.push(vec![InlineKeyboardButton::new(
        "⬅ Back to lines",
        CallbackPayload::SkuBack.encode(),
    )]);
    InlineKeyboard {
        inline_keyboard: rows,
    }
}

// ---------------------------------------------------------------------------
// Record assembly

/// Cell value for one line: the selected items joined by ", ", in catalog
/// row order. Selections whose item vanished from the catalog are appended
/// after the ordered ones rather than dropped.
fn line_cell(rows: &[Vec<String>], col: usize, selected: &BTreeSet<String>) -> String {
    let ordered: Vec<String> = line_items(rows, col)
        .into_iter()
        .filter(|name| selected.contains(name))
        .collect();
    let mut parts = ordered;
    for name in selected {
        if !parts.iter().any(|v| v == name) {
            parts.push(name.clone());
        }
    }
    parts.join(", ")
}

#[allow(clippy::too_many_arguments)]
pub fn assemble_record(
    now: DateTime<Utc>,
    agent_name: &str,
    dest_chat: &str,
    venue: &str,
    person: &str,
    contact: &str,
    catalog_rows: &[Vec<String>],
    selections: &SelectionMap,
) -> OrderRecord {
    let lines = catalog_lines(catalog_rows)
        .into_iter()
        .map(|(idx, _)| line_cell(catalog_rows, idx, &selections.selected(idx)))
        .collect();
    OrderRecord {
        submitted_at: timestamp(now),
        agent_name: agent_name.to_string(),
        dest_chat: dest_chat.to_string(),
        venue: venue.to_string(),
        person: person.to_string(),
        contact: contact.to_string(),
        lines,
        status: OrderStatus::Pending,
        token: String::new(),
    }
}

/// Human-readable summary: `"<line name>: item, item"` per line with at
/// least one selection, in catalog order.
pub fn summary_text(catalog_rows: &[Vec<String>], selections: &SelectionMap) -> String {
    let parts: Vec<String> = catalog_lines(catalog_rows)
        .into_iter()
        .filter_map(|(idx, name)| {
            let cell = line_cell(catalog_rows, idx, &selections.selected(idx));
            if cell.is_empty() {
                None
            } else {
                Some(format!("{name}: {cell}"))
            }
        })
        .collect();
    if parts.is_empty() {
        "—".to_string()
    } else {
        parts.join("\n")
    }
}

pub fn notification_text(record: &OrderRecord, summary: &str) -> String {
    format!(
        "Request from {}\nVenue: {}\nItems:\n{}\nTalked to: {}\nContact: {}",
        record.agent_name, record.venue, summary, record.person, record.contact
    )
}

// ---------------------------------------------------------------------------
// Status correlation

/// Finds the order row whose last cell equals the token. Linear scan in
/// sheet order, first match wins. Returns the 1-based sheet row index and
/// the 0-based status column of that row.
pub fn find_status_cell(rows: &[Vec<String>], token: &str) -> Option<(usize, usize)> {
    rows.iter().enumerate().find_map(|(idx, row)| {
        let status_col = status_column(row.len())?;
        if row[row.len() - 1] == token {
            Some((idx + 1, status_col))
        } else {
            None
        }
    })
}

/// True for a human-added header row of the orders sheet, recognized by its
/// first cell. The bot itself never writes a header there.
pub fn is_order_header(row: &[String]) -> bool {
    row.first()
        .map(|cell| cell.trim().eq_ignore_ascii_case("date"))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Venue sync

fn normalize_text(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized dedup key for a venue: lowercased, whitespace-collapsed name,
/// with the address appended as `name (address)` when present.
pub fn normalize_key(name: &str, address: &str) -> String {
    let base = normalize_text(name);
    let addr = normalize_text(address);
    if addr.is_empty() {
        base
    } else {
        format!("{base} ({addr})")
    }
}

/// Builds the venues sheet from the live form rows: header plus one row per
/// unique `(handle, normalized key)`, first occurrence wins. Output rows:
/// handle, venue name, address, normalized key.
pub fn dedupe_venues(source_rows: &[Vec<String>]) -> Vec<Vec<String>> {
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    let mut out = vec![vec![
        "ambassador_username".to_string(),
        "venue_name".to_string(),
        "address".to_string(),
        "normalized_key".to_string(),
    ]];

    for row in source_rows.iter().skip(1) {
        if row.len() <= SOURCE_ADDRESS_COL {
            continue;
        }
        let handle = row[SOURCE_HANDLE_COL].trim();
        let venue = row[SOURCE_VENUE_COL].trim();
        let address = row[SOURCE_ADDRESS_COL].trim();
        if handle.is_empty() || venue.is_empty() {
            continue;
        }
        let key = normalize_key(venue, address);
        if !seen.insert((handle.to_lowercase(), key.clone())) {
            continue;
        }
        out.push(vec![
            handle.to_string(),
            venue.to_string(),
            address.to_string(),
            key,
        ]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(cells: &[&[&str]]) -> Vec<Vec<String>> {
        cells
            .iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect()
    }

    fn catalog() -> Vec<Vec<String>> {
        rows(&[
            &["Bliss", "", "Black Line"],
            &["Rose", "", "Coal"],
            &["Lily", "", "Ash"],
            &["", "", "Ember"],
        ])
    }

    #[test]
    fn catalog_lines_skip_blank_headers_and_keep_column_order() {
        assert_eq!(
            catalog_lines(&catalog()),
            vec![(0, "Bliss".to_string()), (2, "Black Line".to_string())]
        );
        assert!(catalog_lines(&[]).is_empty());
    }

    #[test]
    fn line_items_follow_row_order_and_skip_blanks() {
        let items = line_items(&catalog(), 2);
        assert_eq!(items, vec!["Coal", "Ash", "Ember"]);
        assert_eq!(line_items(&catalog(), 0), vec!["Rose", "Lily"]);
        assert!(line_items(&catalog(), 7).is_empty());
    }

    #[test]
    fn item_filter_is_case_insensitive_substring() {
        let items = line_items(&catalog(), 2);
        assert_eq!(filter_items(&items, "AS"), vec!["Ash"]);
        assert_eq!(filter_items(&items, "o"), vec!["Coal"]);
        assert!(filter_items(&items, "rose").is_empty());
    }

    #[test]
    fn toggle_parity_controls_membership() {
        let mut selections = SelectionMap::default();
        for round in 1..=6 {
            let now = selections.toggle(0, "Rose");
            assert_eq!(now, round % 2 == 1);
            assert_eq!(selections.is_selected(0, "Rose"), round % 2 == 1);
        }
        assert!(selections.is_empty());
    }

    #[test]
    fn selections_survive_line_switches() {
        let mut selections = SelectionMap::default();
        selections.toggle(0, "Rose");
        selections.toggle(0, "Lily");
        for _ in 0..5 {
            selections.toggle(2, "Coal");
            selections.toggle(2, "Coal");
        }
        let line_a = selections.selected(0);
        assert!(line_a.contains("Rose") && line_a.contains("Lily"));
        assert!(selections.selected(2).is_empty());
        assert!(!selections.is_empty());
    }

    #[test]
    fn venue_match_has_three_outcomes() {
        let venues = vec![
            "Cafe A".to_string(),
            "Cafe Bravo".to_string(),
            "Tavern".to_string(),
        ];
        assert_eq!(match_venues(&venues, "zzz"), VenueMatch::None);
        assert_eq!(
            match_venues(&venues, "tav"),
            VenueMatch::One("Tavern".to_string())
        );
        assert_eq!(
            match_venues(&venues, "cafe"),
            VenueMatch::Many(vec!["Cafe A".to_string(), "Cafe Bravo".to_string()])
        );
    }

    #[test]
    fn venues_for_matches_handle_case_insensitively() {
        let sheet = rows(&[
            &["ambassador_username", "venue_name"],
            &["@alex", "Cafe A"],
            &["@ALEX", "Cafe B"],
            &["@kim", "Tavern"],
        ]);
        assert_eq!(venues_for(&sheet, "@Alex"), vec!["Cafe A", "Cafe B"]);
        assert!(venues_for(&sheet, "@nobody").is_empty());
    }

    #[test]
    fn binding_upsert_overwrites_in_place() {
        let sheet = rows(&[
            &["ambassador_username", "chat_id"],
            &["@alex", "111"],
            &["@kim", "222"],
        ]);
        let rebound = upsert_binding(&sheet, "@alex", 777);
        assert_eq!(rebound.len(), 3);
        assert_eq!(rebound[1], vec!["@alex", "777"]);
        assert_eq!(chat_binding(&rebound, "@alex").as_deref(), Some("777"));

        let appended = upsert_binding(&rebound, "@new", 333);
        assert_eq!(appended.len(), 4);
        assert_eq!(chat_binding(&appended, "@new").as_deref(), Some("333"));

        let fresh = upsert_binding(&[], "@solo", 5);
        assert_eq!(fresh.len(), 2);
        assert_eq!(chat_binding(&fresh, "@solo").as_deref(), Some("5"));
    }

    #[test]
    fn establishment_pages_hold_ten_entries_with_nav_rows() {
        let venues: Vec<String> = (0..23).map(|i| format!("Venue {i:02}")).collect();

        let first = establishments_keyboard(&venues, 0);
        assert_eq!(first.inline_keyboard.len(), 11);
        assert_eq!(first.inline_keyboard[10][0].callback_data, "estpage_1");

        let middle = establishments_keyboard(&venues, 1);
        let nav = middle.inline_keyboard.last().unwrap();
        assert_eq!(nav[0].callback_data, "estpage_0");
        assert_eq!(nav[1].callback_data, "estpage_2");

        let last = establishments_keyboard(&venues, 2);
        assert_eq!(last.inline_keyboard.len(), 4);
        let nav = last.inline_keyboard.last().unwrap();
        assert_eq!(nav.len(), 1);
        assert_eq!(nav[0].callback_data, "estpage_1");
    }

    #[test]
    fn sku_keyboard_marks_selected_items_and_keeps_full_name_payloads() {
        let long_name = "An Extraordinarily Long Item Name".to_string();
        let items = vec!["Rose".to_string(), long_name.clone()];
        let mut selected = BTreeSet::new();
        selected.insert(long_name.clone());

        let keyboard = sku_keyboard(&items, &selected);
        assert_eq!(keyboard.inline_keyboard.len(), 4);
        assert_eq!(keyboard.inline_keyboard[0][0].text, "Rose");
        assert_eq!(
            keyboard.inline_keyboard[1][0].text,
            format!("✅ {}", display_key(&long_name))
        );
        assert_eq!(
            keyboard.inline_keyboard[1][0].callback_data,
            format!("sku_{long_name}")
        );
        assert_eq!(keyboard.inline_keyboard[2][0].callback_data, "sku_done");
        assert_eq!(keyboard.inline_keyboard[3][0].callback_data, "sku_back");
    }

    #[test]
    fn assembled_row_has_one_cell_per_header_line() {
        let mut selections = SelectionMap::default();
        selections.toggle(0, "Rose");
        let record = assemble_record(
            Utc::now(),
            "Alex Smith",
            "777",
            "Cafe A",
            "Maria",
            "+1555",
            &catalog(),
            &selections,
        );
        assert_eq!(record.lines, vec!["Rose".to_string(), String::new()]);
        let row = record.to_row();
        assert_eq!(row.len(), 6 + 2 + 2);
        assert_eq!(&row[1..7], &["Alex Smith", "777", "Cafe A", "Maria", "+1555", "Rose"]);
    }

    #[test]
    fn line_cells_join_in_catalog_row_order() {
        let mut selections = SelectionMap::default();
        // Toggled out of sheet order on purpose.
        selections.toggle(2, "Ember");
        selections.toggle(2, "Coal");
        let record = assemble_record(
            Utc::now(),
            "a",
            "1",
            "v",
            "p",
            "c",
            &catalog(),
            &selections,
        );
        assert_eq!(record.lines[1], "Coal, Ember");
    }

    #[test]
    fn summary_omits_empty_lines() {
        let mut selections = SelectionMap::default();
        selections.toggle(0, "Rose");
        assert_eq!(summary_text(&catalog(), &selections), "Bliss: Rose");
        assert_eq!(summary_text(&catalog(), &SelectionMap::default()), "—");
    }

    #[test]
    fn token_scan_returns_first_match_in_sheet_order() {
        let sheet = rows(&[
            &["d", "a", "1", "v", "p", "c", "Rose", "", "", "1000"],
            &["d", "a", "1", "v", "p", "c", "Coal", "", "confirmed", "1001"],
            &["d", "a", "1", "v", "p", "c", "Ash", "", "", "1001"],
        ]);
        assert_eq!(find_status_cell(&sheet, "1000"), Some((1, 8)));
        assert_eq!(find_status_cell(&sheet, "1001"), Some((2, 8)));
        assert_eq!(find_status_cell(&sheet, "9999"), None);
    }

    #[test]
    fn session_expiry_compares_idle_time() {
        let start = Utc::now();
        let session = Session::new(start);
        let timeout = Duration::minutes(30);
        assert!(!session.expired(start + Duration::minutes(29), timeout));
        assert!(session.expired(start + Duration::minutes(31), timeout));
    }

    #[test]
    fn venue_dedupe_keeps_first_occurrence_per_normalized_key() {
        let source = rows(&[
            &["ts", "handle", "x", "venue", "address"],
            &["1", "@alex", "", "Cafe A", "Main st 1"],
            &["2", "@alex", "", "cafe  a", "main ST 1"],
            &["3", "@alex", "", "Cafe A", "Other st 9"],
            &["4", "@kim", "", "Cafe A", "Main st 1"],
            &["5", "", "", "Orphan", "Nowhere"],
            &["6", "@kim", "", "", "Main st 1"],
        ]);
        let out = dedupe_venues(&source);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0][3], "normalized_key");
        assert_eq!(out[1], vec!["@alex", "Cafe A", "Main st 1", "cafe a (main st 1)"]);
        assert_eq!(out[2][3], "cafe a (other st 9)");
        assert_eq!(out[3][0], "@kim");
    }

    #[test]
    fn employee_lookup_skips_header() {
        let sheet = rows(&[&["username"], &["@alex"], &["@Kim"]]);
        assert!(is_employee(&sheet, "@alex"));
        assert!(is_employee(&sheet, "@kim"));
        assert!(!is_employee(&sheet, "@username"));
        assert!(!is_employee(&sheet, "@ghost"));
    }

    #[test]
    fn order_header_rows_are_recognized_by_their_first_cell() {
        let header = vec!["  Date ".to_string(), "Ambassador".to_string()];
        assert!(is_order_header(&header));
        let order = vec!["2026-08-29 10:00:00".to_string(), "Alex Smith".to_string()];
        assert!(!is_order_header(&order));
        assert!(!is_order_header(&[]));
    }
}

use serde::{Deserialize, Serialize};

/// Minimum cell count of an order row: the six fixed prefix columns plus
/// the trailing status and token columns. Rows shorter than this cannot
/// carry a single catalog line and are rejected by [`OrderRecord::from_row`].
pub const ORDER_ROW_MIN_LEN: usize = 8;

/// One inbound webhook delivery. Exactly one of the optional payloads is
/// expected to be set; extra transport fields are ignored so real bot-API
/// payloads deserialize unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.kind == "private"
    }

    pub fn is_group(&self) -> bool {
        self.kind == "group" || self.kind == "supergroup"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl User {
    pub fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }

    /// The `@username` handle used across the sheets. Accounts without a
    /// username cannot be looked up, bound, or authorized.
    pub fn handle(&self) -> Option<String> {
        self.username
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| format!("@{v}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboard {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineKeyboardButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Parsed form of the `callback_data` scheme. The wire strings are the
/// contract shared with already-delivered keyboards, so parsing and
/// encoding must stay inverse to each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackPayload {
    Establishment(String),
    EstablishmentPage(usize),
    Line(usize),
    LinesDone,
    Sku(String),
    SkuDone,
    SkuBack,
    Confirm { token: Option<String> },
    Reject { token: Option<String> },
}

impl CallbackPayload {
    pub fn parse(data: &str) -> Option<Self> {
        match data {
            "lines_done" => return Some(Self::LinesDone),
            "sku_done" => return Some(Self::SkuDone),
            "sku_back" => return Some(Self::SkuBack),
            "confirm" => return Some(Self::Confirm { token: None }),
            "reject" => return Some(Self::Reject { token: None }),
            _ => {}
        }
        if let Some(rest) = data.strip_prefix("confirm_") {
            return Some(Self::Confirm {
                token: Some(rest.to_string()),
            });
        }
        if let Some(rest) = data.strip_prefix("reject_") {
            return Some(Self::Reject {
                token: Some(rest.to_string()),
            });
        }
        if let Some(rest) = data.strip_prefix("estpage_") {
            return rest.parse().ok().map(Self::EstablishmentPage);
        }
        if let Some(rest) = data.strip_prefix("est_") {
            return Some(Self::Establishment(rest.to_string()));
        }
        if let Some(rest) = data.strip_prefix("line_") {
            return rest.parse().ok().map(Self::Line);
        }
        if let Some(rest) = data.strip_prefix("sku_") {
            return Some(Self::Sku(rest.to_string()));
        }
        None
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Establishment(name) => format!("est_{name}"),
            Self::EstablishmentPage(page) => format!("estpage_{page}"),
            Self::Line(idx) => format!("line_{idx}"),
            Self::LinesDone => "lines_done".to_string(),
            Self::Sku(name) => format!("sku_{name}"),
            Self::SkuDone => "sku_done".to_string(),
            Self::SkuBack => "sku_back".to_string(),
            Self::Confirm { token: None } => "confirm".to_string(),
            Self::Confirm { token: Some(t) } => format!("confirm_{t}"),
            Self::Reject { token: None } => "reject".to_string(),
            Self::Reject { token: Some(t) } => format!("reject_{t}"),
        }
    }
}

/// One outbound transport call performed while handling an update. The
/// webhook response lists them in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundAction {
    SendMessage {
        chat_id: i64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_markup: Option<InlineKeyboard>,
    },
    EditMessageText {
        chat_id: i64,
        message_id: i64,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_markup: Option<InlineKeyboard>,
    },
    EditReplyMarkup {
        chat_id: i64,
        message_id: i64,
        reply_markup: InlineKeyboard,
    },
    AnswerCallback {
        callback_query_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        show_alert: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub actions: Vec<OutboundAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl OrderStatus {
    /// On-sheet cell value. Pending orders keep the cell empty.
    pub fn cell_value(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn from_cell(value: &str) -> Self {
        match value.trim() {
            "confirmed" => OrderStatus::Confirmed,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }
}

/// An order row with the sheet's column layout made explicit: six fixed
/// prefix columns, one column per catalog line, then status and the
/// correlation token. The column order of `to_row` must not change — live
/// sheets already hold rows in this layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub submitted_at: String,
    pub agent_name: String,
    pub dest_chat: String,
    pub venue: String,
    pub person: String,
    pub contact: String,
    pub lines: Vec<String>,
    pub status: OrderStatus,
    pub token: String,
}

impl OrderRecord {
    pub fn to_row(&self) -> Vec<String> {
        let mut row = Vec::with_capacity(ORDER_ROW_MIN_LEN + self.lines.len());
        row.push(self.submitted_at.clone());
        row.push(self.agent_name.clone());
        row.push(self.dest_chat.clone());
        row.push(self.venue.clone());
        row.push(self.person.clone());
        row.push(self.contact.clone());
        row.extend(self.lines.iter().cloned());
        row.push(self.status.cell_value().to_string());
        row.push(self.token.clone());
        row
    }

    /// The trailing columns are addressed from the row end because the
    /// line-column count varies with the catalog.
    pub fn from_row(row: &[String]) -> Option<Self> {
        if row.len() < ORDER_ROW_MIN_LEN {
            return None;
        }
        let token_idx = row.len() - 1;
        let status_idx = token_idx - 1;
        Some(Self {
            submitted_at: row[0].clone(),
            agent_name: row[1].clone(),
            dest_chat: row[2].clone(),
            venue: row[3].clone(),
            person: row[4].clone(),
            contact: row[5].clone(),
            lines: row[6..status_idx].to_vec(),
            status: OrderStatus::from_cell(&row[status_idx]),
            token: row[token_idx].clone(),
        })
    }
}

/// Zero-based column index of the status cell for a row of the given width.
pub fn status_column(row_len: usize) -> Option<usize> {
    if row_len < 2 {
        return None;
    }
    Some(row_len - 2)
}

/// A1-style column letter for a zero-based index (`0 -> A`, `26 -> AA`).
pub fn column_letter(index: usize) -> String {
    let mut letters = Vec::new();
    let mut rest = index;
    loop {
        letters.push((b'A' + (rest % 26) as u8) as char);
        if rest < 26 {
            break;
        }
        rest = rest / 26 - 1;
    }
    letters.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn callback_payloads_round_trip() {
        let cases = [
            (
                "est_Cafe A",
                CallbackPayload::Establishment("Cafe A".to_string()),
            ),
            ("estpage_2", CallbackPayload::EstablishmentPage(2)),
            ("line_0", CallbackPayload::Line(0)),
            ("lines_done", CallbackPayload::LinesDone),
            (
                "sku_Rose Petal No. 9",
                CallbackPayload::Sku("Rose Petal No. 9".to_string()),
            ),
            ("sku_done", CallbackPayload::SkuDone),
            ("sku_back", CallbackPayload::SkuBack),
            ("confirm", CallbackPayload::Confirm { token: None }),
            (
                "confirm_1007",
                CallbackPayload::Confirm {
                    token: Some("1007".to_string()),
                },
            ),
            (
                "reject_1007",
                CallbackPayload::Reject {
                    token: Some("1007".to_string()),
                },
            ),
        ];
        for (wire, payload) in cases {
            assert_eq!(
                CallbackPayload::parse(wire).as_ref(),
                Some(&payload),
                "{wire}"
            );
            assert_eq!(payload.encode(), wire);
        }
    }

    #[test]
    fn unknown_callback_payload_parses_to_none() {
        assert_eq!(CallbackPayload::parse(""), None);
        assert_eq!(CallbackPayload::parse("noop"), None);
        assert_eq!(CallbackPayload::parse("estpage_x"), None);
        assert_eq!(CallbackPayload::parse("line_"), None);
    }

    #[test]
    fn update_deserializes_from_bot_api_shape() {
        let raw = json!({
            "update_id": 42,
            "message": {
                "message_id": 7,
                "date": 1_700_000_000,
                "chat": {"id": -100123, "type": "supergroup", "title": "Distributors"},
                "from": {"id": 9, "is_bot": false, "first_name": "Alex", "username": "alex"},
                "text": "/bind"
            }
        });
        let update: Update = serde_json::from_value(raw).unwrap();
        let message = update.message.unwrap();
        assert!(message.chat.is_group());
        assert_eq!(message.from.unwrap().handle().as_deref(), Some("@alex"));
    }

    #[test]
    fn order_record_row_round_trip() {
        let record = OrderRecord {
            submitted_at: "2026-08-29 10:00:00".to_string(),
            agent_name: "Alex Smith".to_string(),
            dest_chat: "777".to_string(),
            venue: "Cafe A".to_string(),
            person: "Maria".to_string(),
            contact: "+1555".to_string(),
            lines: vec!["Rose".to_string(), String::new(), String::new()],
            status: OrderStatus::Pending,
            token: "1000".to_string(),
        };
        let row = record.to_row();
        assert_eq!(row.len(), 6 + 3 + 2);
        assert_eq!(row[6], "Rose");
        assert_eq!(row[row.len() - 2], "");
        assert_eq!(row[row.len() - 1], "1000");
        assert_eq!(OrderRecord::from_row(&row), Some(record));
    }

    #[test]
    fn from_row_rejects_short_rows() {
        let row: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        assert_eq!(OrderRecord::from_row(&row), None);
    }

    #[test]
    fn status_column_is_second_from_the_end() {
        assert_eq!(status_column(10), Some(8));
        assert_eq!(status_column(8), Some(6));
        assert_eq!(status_column(1), None);
    }

    #[test]
    fn column_letters_extend_past_z() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(8), "I");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(27), "AB");
    }
}

//! Chat completion backends.
//!
//! Stage logic only sees [`ChatClient`]. The concrete [`ChatBackend`] variant is chosen
//! once from configuration and never inspected afterwards.

use std::fmt;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::contract::{GeneratedFile, GeneratedFileSet};
use crate::core::persona::Persona;
use crate::core::retry::Transient;
use crate::io::config::{BackendKind, TeamConfig};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("backend returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("undecodable backend response: {0}")]
    Decode(String),
    #[error("chat backend misconfigured: {0}")]
    Config(String),
}

impl Transient for ChatError {
    fn is_transient(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::Status { .. })
    }
}

/// Generation/planning collaborator: ordered messages in, assistant text out.
pub trait ChatClient {
    fn chat(&self, messages: &[ChatMessage], temperature: f64) -> Result<String, ChatError>;
}

/// The closed set of supported backends.
pub enum ChatBackend {
    Mock(MockChat),
    Ollama {
        http: Client,
        base_url: String,
        model: String,
    },
    Anthropic {
        http: Client,
        base_url: String,
        api_key: String,
        model: String,
        max_tokens: u32,
    },
    OpenAi {
        http: Client,
        base_url: String,
        api_key: String,
        model: String,
    },
}

impl fmt::Debug for ChatBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatBackend::Mock(_) => f.write_str("Mock"),
            ChatBackend::Ollama { model, .. } => write!(f, "Ollama({model})"),
            ChatBackend::Anthropic { model, .. } => write!(f, "Anthropic({model})"),
            ChatBackend::OpenAi { model, .. } => write!(f, "OpenAi({model})"),
        }
    }
}

/// Clients for the general stages (planning, design, review) and for generation.
#[derive(Debug)]
pub struct ChatClients {
    pub general: ChatBackend,
    pub coder: ChatBackend,
}

/// Build both clients, reading API keys from the process environment.
pub fn build_chat_clients(cfg: &TeamConfig) -> Result<ChatClients, ChatError> {
    build_chat_clients_with(cfg, |key| std::env::var(key).ok())
}

/// Build both clients with an explicit secret lookup.
pub fn build_chat_clients_with(
    cfg: &TeamConfig,
    secret: impl Fn(&str) -> Option<String>,
) -> Result<ChatClients, ChatError> {
    let api_key = |var: &str| {
        secret(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ChatError::Config(format!("{var} is not set but backend is {}", cfg.backend))
            })
    };

    let clients = match cfg.backend {
        BackendKind::Mock => ChatClients {
            general: ChatBackend::Mock(MockChat::new(&cfg.required_file)),
            coder: ChatBackend::Mock(MockChat::new(&cfg.required_file)),
        },
        BackendKind::Ollama => {
            let ollama = |model: &str| -> Result<ChatBackend, ChatError> {
                Ok(ChatBackend::Ollama {
                    http: http_client(cfg)?,
                    base_url: trim_base(&cfg.ollama.base_url),
                    model: model.to_string(),
                })
            };
            ChatClients {
                general: ollama(cfg.ollama.general_model())?,
                coder: ollama(cfg.ollama.coder_model())?,
            }
        }
        BackendKind::Anthropic => {
            let key = api_key("ANTHROPIC_API_KEY")?;
            let anthropic = || -> Result<ChatBackend, ChatError> {
                Ok(ChatBackend::Anthropic {
                    http: http_client(cfg)?,
                    base_url: trim_base(&cfg.anthropic.base_url),
                    api_key: key.clone(),
                    model: cfg.anthropic.model.clone(),
                    max_tokens: cfg.chat.max_tokens,
                })
            };
            ChatClients {
                general: anthropic()?,
                coder: anthropic()?,
            }
        }
        BackendKind::OpenAi => {
            let key = api_key("OPENAI_API_KEY")?;
            let openai = || -> Result<ChatBackend, ChatError> {
                Ok(ChatBackend::OpenAi {
                    http: http_client(cfg)?,
                    base_url: trim_base(&cfg.openai.base_url),
                    api_key: key.clone(),
                    model: cfg.openai.model.clone(),
                })
            };
            ChatClients {
                general: openai()?,
                coder: openai()?,
            }
        }
    };
    debug!(general = ?clients.general, coder = ?clients.coder, "built chat clients");
    Ok(clients)
}

fn http_client(cfg: &TeamConfig) -> Result<Client, ChatError> {
    Client::builder()
        .timeout(Duration::from_secs(cfg.chat.timeout_secs))
        .build()
        .map_err(|err| ChatError::Config(format!("build http client: {err}")))
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

impl ChatClient for ChatBackend {
    #[instrument(skip_all, fields(backend = ?self, messages = messages.len()))]
    fn chat(&self, messages: &[ChatMessage], temperature: f64) -> Result<String, ChatError> {
        match self {
            ChatBackend::Mock(mock) => Ok(mock.respond(messages)),
            ChatBackend::Ollama {
                http,
                base_url,
                model,
            } => {
                let body = json!({
                    "model": model,
                    "stream": false,
                    "messages": messages,
                    "options": {"temperature": temperature},
                });
                let reply: OllamaReply =
                    post_json(http.post(format!("{base_url}/api/chat")), &body)?;
                Ok(reply.message.map(|m| m.content).unwrap_or_default())
            }
            ChatBackend::Anthropic {
                http,
                base_url,
                api_key,
                model,
                max_tokens,
            } => {
                let body = anthropic_payload(messages, model, *max_tokens, temperature);
                let request = http
                    .post(format!("{base_url}/messages"))
                    .header("x-api-key", api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION);
                let reply: AnthropicReply = post_json(request, &body)?;
                Ok(reply.text())
            }
            ChatBackend::OpenAi {
                http,
                base_url,
                api_key,
                model,
            } => {
                let body = json!({
                    "model": model,
                    "messages": messages,
                    "temperature": temperature,
                });
                let request = http
                    .post(format!("{base_url}/chat/completions"))
                    .bearer_auth(api_key);
                let reply: OpenAiReply = post_json(request, &body)?;
                Ok(reply.text())
            }
        }
    }
}

fn post_json<T: for<'de> Deserialize<'de>>(
    request: reqwest::blocking::RequestBuilder,
    body: &Value,
) -> Result<T, ChatError> {
    let response = request
        .json(body)
        .send()
        .map_err(|err| ChatError::Transport(err.to_string()))?;
    let status = response.status();
    let text = response
        .text()
        .map_err(|err| ChatError::Transport(err.to_string()))?;
    if !status.is_success() {
        return Err(ChatError::Status {
            code: status.as_u16(),
            body: text.chars().take(ERROR_BODY_CHARS).collect(),
        });
    }
    serde_json::from_str(&text).map_err(|err| ChatError::Decode(err.to_string()))
}

/// System messages are joined into the top-level `system` field.
fn anthropic_payload(messages: &[ChatMessage], model: &str, max_tokens: u32, temperature: f64) -> Value {
    let system = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let conversation: Vec<&ChatMessage> =
        messages.iter().filter(|m| m.role != Role::System).collect();
    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "temperature": temperature,
        "messages": conversation,
    });
    if !system.trim().is_empty() {
        body["system"] = Value::String(system.trim().to_string());
    }
    body
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    #[serde(default)]
    message: Option<ReplyMessage>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicReply {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicReply {
    fn text(self) -> String {
        self.content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiReply {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiReply {
    fn text(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default()
    }
}

/// Offline backend with canned answers chosen by the calling stage's persona.
#[derive(Debug, Clone)]
pub struct MockChat {
    required_file: String,
}

impl MockChat {
    pub fn new(required_file: &str) -> Self {
        Self {
            required_file: required_file.to_string(),
        }
    }

    fn respond(&self, messages: &[ChatMessage]) -> String {
        let persona = messages
            .iter()
            .find(|m| m.role == Role::System)
            .and_then(|m| Persona::from_system_prompt(&m.content));
        match persona {
            Some(Persona::ProductManager) => MOCK_REQUIREMENTS.to_string(),
            Some(Persona::Architect) => MOCK_ARCHITECTURE.replace("{entry}", &self.required_file),
            Some(Persona::Coder) => self.file_set_reply(),
            Some(Persona::Reviewer) => MOCK_REVIEW.to_string(),
            None => "OK".to_string(),
        }
    }

    fn file_set_reply(&self) -> String {
        let set = GeneratedFileSet {
            files: vec![
                GeneratedFile {
                    path: self.required_file.clone(),
                    content: MOCK_MAIN.to_string(),
                },
                GeneratedFile {
                    path: "board.py".to_string(),
                    content: MOCK_BOARD.to_string(),
                },
                GeneratedFile {
                    path: "requirements.txt".to_string(),
                    content: String::new(),
                },
            ],
            notes: "Terminal snake on a fixed grid; standard library only.".to_string(),
        };
        let body = serde_json::to_string_pretty(&set).unwrap_or_else(|_| "{}".to_string());
        format!("Here is the project.\n\n```json\n{body}\n```\n")
    }
}

const MOCK_REQUIREMENTS: &str = "\
Goal: a small terminal snake game.
User stories: the player steers the snake with w/a/s/d; eating food grows the snake; \
hitting a wall or itself ends the game.
Scope: single player, one terminal, score counter.
Non-goals: networking, graphics, persistence.
Acceptance: starts without extra packages; moves; grows on food; reports game over.
Risks: terminal input differs across platforms.";

const MOCK_ARCHITECTURE: &str = "\
Files:
- {entry}: input loop and rendering
- board.py: grid, snake movement, food placement
- requirements.txt: empty, standard library only";

const MOCK_REVIEW: &str = "\
1) High: none found.
2) Medium: add unit tests for board.step collision handling.
3) Low: make grid size and tick rate configurable.";

const MOCK_MAIN: &str = r#"import sys

from board import Board


KEYS = {"w": (0, -1), "s": (0, 1), "a": (-1, 0), "d": (1, 0)}


def render(board: Board) -> str:
    rows = []
    for y in range(board.height):
        row = []
        for x in range(board.width):
            if (x, y) == board.snake[0]:
                row.append("@")
            elif (x, y) in board.snake:
                row.append("o")
            elif (x, y) == board.food:
                row.append("*")
            else:
                row.append(".")
        rows.append("".join(row))
    rows.append(f"score: {board.score}")
    return "\n".join(rows)


def main() -> int:
    board = Board(width=16, height=10)
    print(render(board))
    for line in sys.stdin:
        key = line.strip().lower()[:1]
        if key == "q":
            break
        if key in KEYS:
            board.turn(KEYS[key])
        if not board.step():
            print("game over, score:", board.score)
            return 0
        print(render(board))
    return 0


if __name__ == "__main__":
    raise SystemExit(main())
"#;

const MOCK_BOARD: &str = r#"import random


class Board:
    def __init__(self, width: int, height: int, seed: int = 7) -> None:
        self.width = width
        self.height = height
        self.rng = random.Random(seed)
        self.snake = [(width // 2, height // 2)]
        self.direction = (1, 0)
        self.score = 0
        self.food = self._place_food()

    def _place_food(self) -> tuple:
        free = [
            (x, y)
            for x in range(self.width)
            for y in range(self.height)
            if (x, y) not in self.snake
        ]
        return self.rng.choice(free) if free else self.snake[0]

    def turn(self, direction: tuple) -> None:
        if (direction[0] + self.direction[0], direction[1] + self.direction[1]) != (0, 0):
            self.direction = direction

    def step(self) -> bool:
        x, y = self.snake[0]
        head = (x + self.direction[0], y + self.direction[1])
        inside = 0 <= head[0] < self.width and 0 <= head[1] < self.height
        if not inside or head in self.snake:
            return False
        self.snake.insert(0, head)
        if head == self.food:
            self.score += 1
            self.food = self._place_food()
        else:
            self.snake.pop()
        return True
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::json_extract::extract_json_object;

    fn ask(mock: &MockChat, persona: Persona) -> String {
        mock.respond(&[
            ChatMessage::system(persona.system_prompt()),
            ChatMessage::user("make a game"),
        ])
    }

    #[test]
    fn mock_answers_by_persona() {
        let mock = MockChat::new("main.py");
        assert!(ask(&mock, Persona::ProductManager).starts_with("Goal:"));
        assert!(ask(&mock, Persona::Architect).contains("main.py: input loop"));
        assert!(ask(&mock, Persona::Reviewer).contains("High"));
    }

    #[test]
    fn mock_generation_is_a_valid_file_set_with_entry_point() {
        let mock = MockChat::new("app.py");
        let reply = ask(&mock, Persona::Coder);
        let object = extract_json_object(&reply).expect("json object");
        let set = GeneratedFileSet::from_value(&Value::Object(object))
            .expect("schema")
            .validate()
            .expect("contract");
        assert!(set.require("app.py").is_ok());
    }

    #[test]
    fn transport_and_status_errors_are_transient() {
        assert!(ChatError::Transport("reset".into()).is_transient());
        assert!(
            ChatError::Status {
                code: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!ChatError::Decode("bad".into()).is_transient());
        assert!(!ChatError::Config("no key".into()).is_transient());
    }

    #[test]
    fn keyed_backend_without_key_is_a_config_error() {
        let mut cfg = TeamConfig::default();
        cfg.backend = BackendKind::Anthropic;
        let err = build_chat_clients_with(&cfg, |_| None).expect_err("missing key");
        assert!(matches!(err, ChatError::Config(_)));
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn ollama_clients_use_role_specific_models() {
        let mut cfg = TeamConfig::default();
        cfg.backend = BackendKind::Ollama;
        cfg.ollama.model_coder = Some("coder".to_string());
        let clients = build_chat_clients_with(&cfg, |_| None).expect("build");
        assert_eq!(format!("{:?}", clients.general), "Ollama(deepseek-r1:latest)");
        assert_eq!(format!("{:?}", clients.coder), "Ollama(coder)");
    }

    #[test]
    fn anthropic_payload_moves_system_messages() {
        let body = anthropic_payload(
            &[
                ChatMessage::system("be brief"),
                ChatMessage::user("hello"),
            ],
            "model-x",
            2048,
            0.2,
        );
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 2048);
        assert_eq!(body["messages"], json!([{"role": "user", "content": "hello"}]));
    }

    #[test]
    fn reply_shapes_decode_to_text() {
        let anthropic: AnthropicReply = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "a"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": "b"}
            ]
        }))
        .expect("decode");
        assert_eq!(anthropic.text(), "a\nb");

        let openai: OpenAiReply = serde_json::from_value(json!({"choices": []})).expect("decode");
        assert_eq!(openai.text(), "");

        let ollama: OllamaReply =
            serde_json::from_value(json!({"message": {"role": "assistant", "content": "hi"}}))
                .expect("decode");
        assert_eq!(ollama.message.map(|m| m.content).as_deref(), Some("hi"));
    }
}

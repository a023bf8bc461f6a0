use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::layout::Point;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

const VIEWPORT: (i64, i64) = (1280, 800);
const MAX_ELEMENTS: usize = 150;
const MAX_TEXT_CHARS: usize = 4000;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true }
    }
}

/// An interactive element found on the page, addressable by its index through
/// the `data-bs-idx` attribute written during [`Browser::page_summary`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ElementInfo {
    pub index: usize,
    pub tag: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PageSummary {
    #[serde(default)]
    pub elements: Vec<ElementInfo>,
    #[serde(default)]
    pub text: String,
}

impl PageSummary {
    pub fn render(&self) -> String {
        let mut out = String::from("interactive elements:\n");
        if self.elements.is_empty() {
            out.push_str("(none)\n");
        }
        for el in &self.elements {
            let _ = write!(out, "[{}] <{}>", el.index, el.tag);
            if !el.text.is_empty() {
                let _ = write!(out, " {}", el.text);
            }
            if let Some(t) = &el.input_type {
                let _ = write!(out, " type={t}");
            }
            if let Some(p) = &el.placeholder {
                let _ = write!(out, " placeholder=\"{p}\"");
            }
            if let Some(h) = &el.href {
                let _ = write!(out, " href={h}");
            }
            out.push('\n');
        }
        out.push_str("page text:\n");
        out.push_str(&self.text);
        out
    }
}

/// Selector for the element tagged with `index` by the last page summary.
pub fn index_selector(index: usize) -> String {
    format!("[data-bs-idx=\"{index}\"]")
}

pub struct Browser {
    page: Page,
    _browser: OxideBrowser,
    _handler: JoinHandle<()>,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // A fresh profile per launch avoids ProcessSingleton lock conflicts.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("browser-search-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)
            .with_context(|| format!("create profile dir {}", profile_dir.display()))?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(VIEWPORT.0 as u32, VIEWPORT.1 as u32)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        let handle = tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        let this = Self { page, _browser: browser, _handler: handle };
        this.set_viewport().await?;
        Ok(this)
    }

    /// Attach to an already running Chrome through its DevTools websocket.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        let handle = tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = match browser.pages().await?.into_iter().next() {
            Some(page) => page,
            None => browser.new_page("about:blank").await?,
        };
        Ok(Self { page, _browser: browser, _handler: handle })
    }

    async fn set_viewport(&self) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(VIEWPORT.0)
            .height(VIEWPORT.1)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        debug!(url, "navigate");
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn back(&self) -> Result<()> {
        self.page.evaluate("history.back()").await?;
        self.wait_for_stable().await
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn title(&self) -> Result<Option<String>> {
        Ok(self.page.get_title().await?)
    }

    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        self.page.move_mouse(Point { x: x as f64, y: y as f64 }).await?;
        Ok(())
    }

    pub async fn click(&self, x: i64, y: i64, button: &str) -> Result<()> {
        let btn = match button {
            "right" => MouseButton::Right,
            "middle" => MouseButton::Middle,
            _ => MouseButton::Left,
        };
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(btn)
            .click_count(1);
        let pressed = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let released = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page
            .move_mouse(Point { x: x as f64, y: y as f64 })
            .await?
            .execute(pressed)
            .await?;
        self.page.execute(released).await?;
        Ok(())
    }

    pub async fn click_selector(&self, selector: &str) -> Result<()> {
        let sel = serde_json::to_string(selector)?;
        let js = format!(
            r#"(() => {{
              const el = document.querySelector({sel});
              if (!el) return false;
              el.scrollIntoView({{block: "center"}});
              el.click();
              return true;
            }})()"#
        );
        let found: bool = self.page.evaluate(js).await?.into_value()?;
        if !found {
            bail!("no element matches {selector}");
        }
        Ok(())
    }

    /// Focus the element and clear any value it holds so typed text replaces it.
    pub async fn focus_selector(&self, selector: &str) -> Result<()> {
        let sel = serde_json::to_string(selector)?;
        let js = format!(
            r#"(() => {{
              const el = document.querySelector({sel});
              if (!el) return false;
              el.scrollIntoView({{block: "center"}});
              el.focus();
              if ("value" in el) el.value = "";
              return true;
            }})()"#
        );
        let found: bool = self.page.evaluate(js).await?.into_value()?;
        if !found {
            bail!("no element matches {selector}");
        }
        Ok(())
    }

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        self.page.evaluate(format!("window.scrollBy({dx}, {dy});")).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        // Input.insertText feeds the focused element
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    /// Press a key or a `+`-joined combination such as `ctrl+l`.
    pub async fn keypress(&self, combo: &str) -> Result<()> {
        let (modifiers, key) = parse_combo(combo);
        let def = key_definition(&key);
        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .modifiers(modifiers)
            .key(def.key.clone())
            .code(def.code.clone())
            .windows_virtual_key_code(def.key_code);
        if modifiers == 0 {
            if let Some(text) = &def.text {
                down = down.text(text.clone());
            }
        }
        let up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .modifiers(modifiers)
            .key(def.key)
            .code(def.code)
            .windows_virtual_key_code(def.key_code);
        self.page.execute(down.build().map_err(|e| anyhow!(e))?).await?;
        self.page.execute(up.build().map_err(|e| anyhow!(e))?).await?;
        Ok(())
    }

    /// Make links and `window.open` stay in the current tab so the agent keeps control.
    pub async fn enable_single_tab_mode(&self) -> Result<()> {
        self.page
            .evaluate(
                r#"(() => {
                  document.querySelectorAll("a[target]").forEach(a => a.removeAttribute("target"));
                  window.open = (u) => { if (u) location.href = u; return window; };
                  return true;
                })()"#,
            )
            .await?;
        Ok(())
    }

    pub async fn page_summary(&self) -> Result<PageSummary> {
        let js = format!(
            r#"(() => {{
              const sel = "a[href], button, input, textarea, select, [role=button], [role=link], [role=tab], [onclick]";
              document.querySelectorAll("[data-bs-idx]").forEach(el => el.removeAttribute("data-bs-idx"));
              const visible = el => {{
                const r = el.getBoundingClientRect();
                const s = getComputedStyle(el);
                return r.width > 0 && r.height > 0 && s.visibility !== "hidden" && s.display !== "none";
              }};
              const elements = [];
              for (const el of document.querySelectorAll(sel)) {{
                if (elements.length >= {MAX_ELEMENTS}) break;
                if (!visible(el) || (el.type === "hidden")) continue;
                const index = elements.length;
                el.setAttribute("data-bs-idx", String(index));
                const label = (el.innerText || el.value || el.getAttribute("aria-label") || el.title || "").trim();
                elements.push({{
                  index,
                  tag: el.tagName.toLowerCase(),
                  text: label.replace(/\s+/g, " ").slice(0, 80),
                  href: el.getAttribute("href"),
                  input_type: el.tagName === "INPUT" ? (el.type || "text") : null,
                  placeholder: el.getAttribute("placeholder"),
                }});
              }}
              const text = (document.body ? document.body.innerText : "").replace(/\n{{3,}}/g, "\n\n").slice(0, {MAX_TEXT_CHARS});
              return {{ elements, text }};
            }})()"#
        );
        let summary: PageSummary = self.page.evaluate(js).await?.into_value()?;
        Ok(summary)
    }

    pub async fn screenshot_b64(&self) -> Result<String> {
        use chromiumoxide::page::ScreenshotParams;
        let take = || async {
            self.page
                .screenshot(ScreenshotParams::builder().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force the viewport and retry once
                    self.set_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(anyhow!(e))
            }
        }
    }

    pub async fn wait_for_stable(&self) -> Result<()> {
        sleep(Duration::from_millis(400)).await;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct KeyDefinition {
    key: String,
    code: String,
    key_code: i64,
    text: Option<String>,
}

const MOD_ALT: i64 = 1;
const MOD_CTRL: i64 = 2;
const MOD_META: i64 = 4;
const MOD_SHIFT: i64 = 8;

fn parse_combo(combo: &str) -> (i64, String) {
    let mut modifiers = 0;
    let mut key = String::new();
    for part in combo.split('+').map(str::trim).filter(|p| !p.is_empty()) {
        match part.to_ascii_lowercase().as_str() {
            "alt" | "option" => modifiers |= MOD_ALT,
            "ctrl" | "control" => modifiers |= MOD_CTRL,
            "meta" | "cmd" | "command" | "super" => modifiers |= MOD_META,
            "shift" => modifiers |= MOD_SHIFT,
            _ => key = part.to_string(),
        }
    }
    (modifiers, key)
}

fn key_definition(name: &str) -> KeyDefinition {
    let named = |key: &str, code: i64, text: Option<&str>| KeyDefinition {
        key: key.to_string(),
        code: key.to_string(),
        key_code: code,
        text: text.map(str::to_string),
    };
    match name.to_ascii_lowercase().as_str() {
        "enter" | "return" => named("Enter", 13, Some("\r")),
        "tab" => named("Tab", 9, None),
        "escape" | "esc" => named("Escape", 27, None),
        "backspace" => named("Backspace", 8, None),
        "delete" => named("Delete", 46, None),
        "arrowup" | "up" => named("ArrowUp", 38, None),
        "arrowdown" | "down" => named("ArrowDown", 40, None),
        "arrowleft" | "left" => named("ArrowLeft", 37, None),
        "arrowright" | "right" => named("ArrowRight", 39, None),
        "pageup" => named("PageUp", 33, None),
        "pagedown" => named("PageDown", 34, None),
        "home" => named("Home", 36, None),
        "end" => named("End", 35, None),
        "space" | " " => KeyDefinition {
            key: " ".into(),
            code: "Space".into(),
            key_code: 32,
            text: Some(" ".into()),
        },
        _ => {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphanumeric() => {
                    let upper = c.to_ascii_uppercase();
                    let code = if c.is_ascii_digit() {
                        format!("Digit{c}")
                    } else {
                        format!("Key{upper}")
                    };
                    KeyDefinition {
                        key: c.to_string(),
                        code,
                        key_code: upper as i64,
                        text: Some(c.to_string()),
                    }
                }
                _ => KeyDefinition {
                    key: name.to_string(),
                    code: name.to_string(),
                    key_code: 0,
                    text: None,
                },
            }
        }
    }
}

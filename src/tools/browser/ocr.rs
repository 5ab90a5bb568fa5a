//! OCR 回退：在整页截图中查找目标文字及其包围盒
//!
//! TesseractOcr 通过 `tesseract stdin stdout tsv` 识别，按行把相邻单词拼接后匹配目标短语。

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// 识别出的文字与其包围盒（截图像素）
#[derive(Debug, Clone, PartialEq)]
pub struct OcrMatch {
    pub text: String,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
}

impl OcrMatch {
    pub fn center(&self) -> (f64, f64) {
        (self.left + self.width / 2.0, self.top + self.height / 2.0)
    }
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// 在 PNG 中查找 needle（大小写不敏感），找不到返回 Ok(None)
    async fn find_text(&self, png: &[u8], needle: &str) -> Result<Option<OcrMatch>, String>;
}

#[derive(Debug, Clone, PartialEq)]
struct OcrWord {
    line: (u32, u32, u32),
    text: String,
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    confidence: f64,
}

/// 解析 tesseract TSV（level page block par line word left top width height conf text）
fn parse_tsv(tsv: &str) -> Vec<OcrWord> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let text = cols[11].trim();
            if text.is_empty() {
                return None;
            }
            let n = |i: usize| cols[i].trim().parse::<f64>().ok();
            let id = |i: usize| cols[i].trim().parse::<u32>().ok();
            Some(OcrWord {
                line: (id(2)?, id(3)?, id(4)?),
                text: text.to_string(),
                left: n(6)?,
                top: n(7)?,
                width: n(8)?,
                height: n(9)?,
                confidence: n(10).unwrap_or(0.0),
            })
        })
        .collect()
}

/// 同一行内找最短的连续单词序列，使其拼接文本包含 needle；多处命中取置信度最高者
fn find_phrase(words: &[OcrWord], needle: &str) -> Option<OcrMatch> {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let mut best: Option<OcrMatch> = None;
    for start in 0..words.len() {
        let mut joined = String::new();
        for end in start..words.len() {
            if words[end].line != words[start].line {
                break;
            }
            if end > start {
                joined.push(' ');
            }
            joined.push_str(&words[end].text.to_lowercase());
            if joined.contains(&needle) {
                let span = &words[start..=end];
                let left = span.iter().map(|w| w.left).fold(f64::MAX, f64::min);
                let top = span.iter().map(|w| w.top).fold(f64::MAX, f64::min);
                let right = span.iter().map(|w| w.left + w.width).fold(f64::MIN, f64::max);
                let bottom = span.iter().map(|w| w.top + w.height).fold(f64::MIN, f64::max);
                let confidence =
                    span.iter().map(|w| w.confidence).sum::<f64>() / span.len() as f64;
                let m = OcrMatch {
                    text: span.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" "),
                    left,
                    top,
                    width: right - left,
                    height: bottom - top,
                    confidence,
                };
                if best.as_ref().map_or(true, |b| m.confidence > b.confidence) {
                    best = Some(m);
                }
                break;
            }
        }
    }
    best
}

/// 调用本机 tesseract 的 OCR 实现
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    bin: String,
    lang: String,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            bin: "tesseract".to_string(),
            lang: "eng+chi_sim".to_string(),
        }
    }
}

impl TesseractOcr {
    pub fn new(bin: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            lang: lang.into(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn find_text(&self, png: &[u8], needle: &str) -> Result<Option<OcrMatch>, String> {
        let mut child = Command::new(&self.bin)
            .args(["stdin", "stdout", "-l", &self.lang, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("cannot start {}: {e}", self.bin))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(png)
                .await
                .map_err(|e| format!("ocr stdin: {e}"))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("ocr: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "tesseract failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let words = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(words = words.len(), needle, "ocr pass finished");
        Ok(find_phrase(&words, needle))
    }
}

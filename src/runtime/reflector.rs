//! Reflector：失败步骤的二次分析
//!
//! 把失败信息、失败步骤、已执行的计划与之前各步结果交给 LLM，要求返回
//! `{is_retryable, confidence, reason, modified_step?, new_plan?}`。
//! 交互类失败且模型支持视觉时附带失败截图（优先取失败结果自带的图片，其次 downloads 下最新的 `*error_*.png`），
//! 宽度超过 1920 的图先缩放再编码，并按原始尺寸给出物理像素 → 逻辑像素的换算说明。
//! 输出不可用（解析失败、置信度过低、两个字段都没有）时退化为原样重试，次数由执行器的预算约束。

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::Engine;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat};
use serde::Deserialize;
use serde_json::Value;

use crate::core::{AgentError, RunContext, Step, StepResult};
use crate::llm::{ImageAttachment, LlmGateway, Message};
use crate::runtime::events::ProgressEvent;
use crate::runtime::planner::{mark_sensitive, step_from_value};

/// 置信度低于此值的修正不采纳
const MIN_CONFIDENCE: f64 = 0.3;
/// 发给模型的截图最大宽度
const MAX_IMAGE_WIDTH: u32 = 1920;
const RESULT_PREVIEW_CHARS: usize = 600;

/// 反思结论
#[derive(Debug, Clone, PartialEq)]
pub enum ReflectionOutcome {
    /// 修正后的单步，替换失败的那一步
    Patched(Step),
    /// 从失败步骤起替换剩余计划
    NewPlan(Vec<Step>),
    /// 没有可用修正，原样重试
    RetryAsIs { reason: String },
    /// 模型判断不可恢复（缺配置、缺依赖、无法从上下文得到参数）
    GiveUp { reason: String },
}

/// 一次反思所需的诊断信息
#[derive(Debug, Clone, Copy)]
pub struct ReflectionRequest<'a> {
    pub instruction: &'a str,
    pub plan: &'a [Step],
    pub step_index: usize,
    pub failing_step: &'a Step,
    pub error: &'a AgentError,
    /// 失败时执行器返回的结果（可能带截图）
    pub failed_result: Option<&'a StepResult>,
    pub prior_results: &'a [StepResult],
    /// 已知的浏览器设备像素比
    pub device_pixel_ratio: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawReflection {
    is_retryable: Option<bool>,
    confidence: Option<f64>,
    #[serde(default)]
    reason: String,
    modified_step: Option<Value>,
    new_plan: Option<Vec<Value>>,
}

/// 编码后的截图
#[derive(Debug, Clone)]
pub struct PreparedScreenshot {
    pub base64: String,
    /// 原始尺寸
    pub width: u32,
    pub height: u32,
    pub path: PathBuf,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
}

/// downloads 下最新的错误截图
pub fn latest_error_screenshot(downloads: &Path) -> Option<PathBuf> {
    let pattern = format!("{}/*error_*.png", glob::Pattern::escape(downloads.to_str()?));
    glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .map(|p| {
            let mtime = p.metadata().and_then(|m| m.modified()).unwrap_or(SystemTime::UNIX_EPOCH);
            (mtime, p)
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, p)| p)
}

/// 截图来源：失败结果自带的图片优先
pub fn find_failure_screenshot(result: Option<&StepResult>, downloads: &Path) -> Option<PathBuf> {
    result
        .into_iter()
        .flat_map(|r| r.images.iter())
        .map(PathBuf::from)
        .find(|p| is_image(p) && p.is_file())
        .or_else(|| latest_error_screenshot(downloads))
}

/// 读取、必要时缩放并编码截图（阻塞，调用方放进 spawn_blocking）
pub fn prepare_screenshot(path: &Path) -> Result<PreparedScreenshot, String> {
    let img = image::open(path).map_err(|e| format!("open {}: {e}", path.display()))?;
    let (width, height) = img.dimensions();
    let scaled = if width > MAX_IMAGE_WIDTH {
        let h = ((height as f64) * (MAX_IMAGE_WIDTH as f64) / (width as f64)).round().max(1.0) as u32;
        tracing::debug!(width, height, to_height = h, "downscaling screenshot for reflection");
        img.resize_exact(MAX_IMAGE_WIDTH, h, FilterType::Lanczos3)
    } else {
        img
    };
    let mut buf = Vec::new();
    scaled
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| format!("encode png: {e}"))?;
    Ok(PreparedScreenshot {
        base64: base64::engine::general_purpose::STANDARD.encode(&buf),
        width,
        height,
        path: path.to_path_buf(),
    })
}

/// 坐标换算说明：已知比例优先，否则宽度超过 1920 视为 2 倍屏。
/// 模型看到的是缩放后的图，换算系数 = (原宽 / 发送宽) / 比例
pub fn coordinate_guidance(width: u32, height: u32, known_ratio: Option<f64>) -> String {
    let ratio = known_ratio
        .filter(|r| r.is_finite() && *r > 0.0)
        .unwrap_or(if width > MAX_IMAGE_WIDTH { 2.0 } else { 1.0 });
    let shown = width.clamp(1, MAX_IMAGE_WIDTH);
    let factor = (width as f64 / shown as f64) / ratio;
    let lw = (width as f64 / ratio).round() as u32;
    let lh = (height as f64 / ratio).round() as u32;
    let mut text = if ratio > 1.0 {
        format!(
            "The screenshot is {width}x{height} physical pixels on a high-density display \
             (device pixel ratio {ratio}); the page viewport is about {lw}x{lh} CSS pixels. "
        )
    } else {
        format!("The screenshot is {width}x{height} pixels and matches the page viewport. ")
    };
    if (factor - 1.0).abs() < 1e-6 {
        text.push_str("Coordinates measured on the attached image are CSS pixels; set \"coordinate_space\": \"logical\".");
    } else {
        text.push_str(&format!(
            "Multiply coordinates measured on the attached image by {factor:.3} to get CSS pixels \
             and set \"coordinate_space\": \"logical\"."
        ));
    }
    text
}

fn preview(v: &impl serde::Serialize) -> String {
    let s = serde_json::to_string(v).unwrap_or_default();
    if s.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", s.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

fn build_prompt(req: &ReflectionRequest<'_>, shot: Option<&PreparedScreenshot>) -> String {
    let mut p = format!(
        "A step of an automation plan failed. Analyse the failure and propose a fix.\n\n\
         ## Instruction\n{}\n\n## Failed step (step {})\n{}\n\n## Error\n{}\n",
        req.instruction,
        req.step_index + 1,
        serde_json::to_string_pretty(req.failing_step).unwrap_or_default(),
        req.error
    );
    if let Some(r) = req.failed_result {
        p.push_str(&format!("\n## Executor result\n{}\n", preview(r)));
    }
    p.push_str("\n## Plan\n");
    for (i, s) in req.plan.iter().enumerate() {
        let status = match i.cmp(&req.step_index) {
            std::cmp::Ordering::Less => "done",
            std::cmp::Ordering::Equal => "FAILED",
            std::cmp::Ordering::Greater => "pending",
        };
        p.push_str(&format!("{}. [{status}] {} {}\n", i + 1, s.step_type, s.description));
    }
    if !req.prior_results.is_empty() {
        p.push_str("\n## Results of earlier steps (reference with {{stepN.path}})\n");
        for (i, r) in req.prior_results.iter().enumerate() {
            p.push_str(&format!("step{}: {}\n", i + 1, preview(r)));
        }
    }
    if matches!(req.error, AgentError::UnresolvedReference { .. }) {
        p.push_str(
            "\nA placeholder in the step could not be resolved. Rewrite the params using a path that exists \
             in the earlier results above, or the literal value. Never invent placeholder text.\n",
        );
    }
    if let Some(shot) = shot {
        p.push_str("\n## Screenshot\nA screenshot taken at the time of failure is attached. ");
        p.push_str("If the selector failed, locate the element visually and use params.x / params.y.\n");
        p.push_str(&coordinate_guidance(shot.width, shot.height, req.device_pixel_ratio));
        p.push('\n');
    }
    p.push_str(
        "\n## Reply\nReturn one JSON object:\n\
         {\"is_retryable\": bool, \"confidence\": 0.0-1.0, \"reason\": \"...\", \
         \"modified_step\": {complete step} | null, \"new_plan\": [steps replacing this and later steps] | null}\n\
         Set is_retryable=false when the error needs user action (missing API key, missing dependency, \
         a value that cannot be found in the context).\n",
    );
    p
}

fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 修正步骤可能只给了部分字段：缺 type 时与原步骤合并（params 逐键覆盖）
fn merge_step(original: &Step, patch: Value) -> Result<Step, AgentError> {
    let Value::Object(patch) = patch else {
        return Err(AgentError::Planning("modified_step is not an object".into()));
    };
    let full = patch.contains_key("type") || patch.contains_key("step_type");
    let mut base = match serde_json::to_value(original) {
        Ok(Value::Object(m)) => m,
        _ => serde_json::Map::new(),
    };
    for (k, v) in patch {
        if !full && k == "params" {
            if let (Value::Object(p), Some(Value::Object(existing))) = (&v, base.get_mut("params")) {
                existing.extend(p.clone());
                continue;
            }
        }
        base.insert(k, v);
    }
    if full {
        base.remove("requires_confirmation");
    }
    step_from_value(Value::Object(base))
}

/// 解析反思输出
pub fn parse_reflection(text: &str, failing_step: &Step) -> ReflectionOutcome {
    let Some(raw) = extract_object(text).and_then(|s| serde_json::from_str::<RawReflection>(s).ok())
    else {
        return ReflectionOutcome::RetryAsIs {
            reason: "reflection output was not valid JSON".into(),
        };
    };
    if raw.is_retryable == Some(false) {
        let reason = if raw.reason.trim().is_empty() {
            "reflection judged the failure unrecoverable".to_string()
        } else {
            raw.reason
        };
        return ReflectionOutcome::GiveUp { reason };
    }
    if let Some(c) = raw.confidence {
        if c < MIN_CONFIDENCE {
            return ReflectionOutcome::RetryAsIs {
                reason: format!("low confidence ({c:.2}): {}", raw.reason),
            };
        }
    }
    if let Some(items) = raw.new_plan.filter(|p| !p.is_empty()) {
        match items.into_iter().map(step_from_value).collect::<Result<Vec<_>, _>>() {
            Ok(mut steps) => {
                mark_sensitive(&mut steps);
                return ReflectionOutcome::NewPlan(steps);
            }
            Err(e) => tracing::warn!(error = %e, "reflection new_plan unusable"),
        }
    }
    if let Some(patch) = raw.modified_step.filter(|v| !v.is_null()) {
        match merge_step(failing_step, patch) {
            Ok(step) => {
                let mut patched = [failing_step.patched(step)];
                mark_sensitive(&mut patched);
                let [patched] = patched;
                return ReflectionOutcome::Patched(patched);
            }
            Err(e) => tracing::warn!(error = %e, "reflection modified_step unusable"),
        }
    }
    ReflectionOutcome::RetryAsIs {
        reason: if raw.reason.is_empty() {
            "no fix proposed".into()
        } else {
            raw.reason
        },
    }
}

/// 反思器：与 Planner 共用 LlmGateway
pub struct Reflector {
    gateway: LlmGateway,
}

impl Reflector {
    pub fn new(gateway: LlmGateway) -> Self {
        Self { gateway }
    }

    async fn screenshot_for(
        &self,
        req: &ReflectionRequest<'_>,
        ctx: &RunContext,
    ) -> Option<PreparedScreenshot> {
        let wants_image = req.error.is_interaction_failure()
            || req.failed_result.is_some_and(|r| !r.images.is_empty());
        if !wants_image || !self.gateway.supports_vision() {
            return None;
        }
        let path = find_failure_screenshot(req.failed_result, &ctx.downloads_dir())?;
        match tokio::task::spawn_blocking(move || prepare_screenshot(&path)).await {
            Ok(Ok(shot)) => Some(shot),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failure screenshot unusable");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "screenshot task failed");
                None
            }
        }
    }

    /// 分析一次失败。LLM 调用失败时原样重试，不向上抛错
    pub async fn reflect(&self, req: ReflectionRequest<'_>, ctx: &RunContext) -> ReflectionOutcome {
        ctx.emit(ProgressEvent::thinking(
            "reflection",
            format!("Step {} failed, analysing: {}", req.step_index + 1, req.error),
        ));
        let shot = self.screenshot_for(&req, ctx).await;
        let mut message = Message::user(build_prompt(&req, shot.as_ref()));
        if let Some(shot) = &shot {
            tracing::info!(path = %shot.path.display(), width = shot.width, "attaching failure screenshot");
            message = message.with_image(ImageAttachment::png(shot.base64.clone()));
        }
        let messages = vec![
            Message::system("You diagnose failed automation steps and reply with JSON only."),
            message,
        ];
        let outcome = match self.gateway.complete(messages, ctx.cancel_token()).await {
            Ok(text) => parse_reflection(&text, req.failing_step),
            Err(e) => {
                tracing::warn!(run_id = %ctx.run_id, error = %e, "reflection call failed");
                ReflectionOutcome::RetryAsIs {
                    reason: format!("reflection unavailable: {e}"),
                }
            }
        };
        let summary = match &outcome {
            ReflectionOutcome::Patched(_) => "applying corrected step".to_string(),
            ReflectionOutcome::NewPlan(steps) => format!("replacing remaining plan with {} steps", steps.len()),
            ReflectionOutcome::RetryAsIs { reason } => format!("retrying as-is: {reason}"),
            ReflectionOutcome::GiveUp { reason } => format!("giving up: {reason}"),
        };
        tracing::info!(run_id = %ctx.run_id, step = req.step_index + 1, %summary, "reflection");
        ctx.emit(ProgressEvent::thinking("reflection_applied", summary));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskScheduler;
    use crate::llm::MockLlmClient;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn failing() -> Step {
        Step::new("open_app", "open", "open music").with_param("app_name", "")
    }

    #[test]
    fn test_partial_patch_merges_params() {
        let step = failing();
        let out = parse_reflection(
            r#"Sure. {"is_retryable": true, "confidence": 0.9, "reason": "name from instruction", "modified_step": {"params": {"app_name": "Music"}}}"#,
            &step,
        );
        match out {
            ReflectionOutcome::Patched(p) => {
                assert_eq!(p.id, step.id);
                assert_eq!(p.step_type, "open_app");
                assert_eq!(p.param_str("app_name"), Some("Music"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_low_confidence_and_garbage_retry_as_is() {
        let step = failing();
        let low = parse_reflection(
            r#"{"is_retryable": true, "confidence": 0.1, "modified_step": {"type": "open_app", "params": {"app_name": "X"}}}"#,
            &step,
        );
        assert!(matches!(low, ReflectionOutcome::RetryAsIs { .. }));
        assert!(matches!(parse_reflection("no idea", &step), ReflectionOutcome::RetryAsIs { .. }));
        assert!(matches!(
            parse_reflection(r#"{"is_retryable": true, "reason": "flaky"}"#, &step),
            ReflectionOutcome::RetryAsIs { .. }
        ));
    }

    #[test]
    fn test_not_retryable_gives_up() {
        let out = parse_reflection(
            r#"{"is_retryable": false, "reason": "needs an API key", "modified_step": null}"#,
            &failing(),
        );
        assert_eq!(out, ReflectionOutcome::GiveUp { reason: "needs an API key".into() });
    }

    #[test]
    fn test_new_plan_and_sensitive_patch() {
        let step = Step::new("python_script", "run", "clean");
        let plan = parse_reflection(
            r#"{"is_retryable": true, "confidence": 0.8, "new_plan": [{"type": "browser_navigate", "params": {"url": "https://a.b"}}, {"type": "browser_click", "params": {"text": "Go"}}]}"#,
            &step,
        );
        assert!(matches!(plan, ReflectionOutcome::NewPlan(ref s) if s.len() == 2));

        let patched = parse_reflection(
            r#"{"is_retryable": true, "confidence": 0.8, "modified_step": {"type": "python_script", "params": {"code": "import shutil\nshutil.rmtree('/')"}}}"#,
            &step,
        );
        match patched {
            ReflectionOutcome::Patched(p) => assert!(p.requires_confirmation),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_screenshot_lookup_and_downscale() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("browser_error_1.png");
        image::RgbImage::new(40, 20).save(&old).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let newest = dir.path().join("click_error_2.png");
        image::RgbImage::new(2400, 300).save(&newest).unwrap();
        image::RgbImage::new(10, 10).save(dir.path().join("unrelated.png")).unwrap();

        assert_eq!(find_failure_screenshot(None, dir.path()), Some(newest.clone()));
        let own = StepResult::failure("x").with_images(vec![old.to_string_lossy().to_string()]);
        assert_eq!(find_failure_screenshot(Some(&own), dir.path()), Some(old));

        let shot = prepare_screenshot(&newest).unwrap();
        assert_eq!((shot.width, shot.height), (2400, 300));
        let bytes = base64::engine::general_purpose::STANDARD.decode(&shot.base64).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (1920, 240));
    }

    #[test]
    fn test_coordinate_guidance() {
        let retina = coordinate_guidance(2880, 1800, None);
        assert!(retina.contains("device pixel ratio 2"));
        assert!(retina.contains("by 0.750"));
        assert!(coordinate_guidance(1440, 900, None).contains("are CSS pixels"));
        let known = coordinate_guidance(1440, 900, Some(1.5));
        assert!(known.contains("device pixel ratio 1.5"));
        assert!(known.contains("by 0.667"));
    }

    fn reflector(mock: Arc<MockLlmClient>) -> Reflector {
        Reflector::new(LlmGateway::new(
            mock,
            Arc::new(TaskScheduler::default()),
            Duration::from_secs(2),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn test_vision_model_gets_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        image::RgbImage::new(2560, 200).save(downloads.join("browser_error_9.png")).unwrap();

        let mock = Arc::new(
            MockLlmClient::with_replies([
                r#"{"is_retryable": true, "confidence": 0.9, "reason": "use coordinates", "modified_step": {"type": "browser_click", "params": {"x": 640, "y": 400}}}"#,
            ])
            .with_vision(true),
        );
        let r = reflector(mock.clone());
        let ctx = RunContext::detached(dir.path());
        let step = Step::new("browser_click", "click", "login").with_param("selector", "#login");
        let err = AgentError::Execution("Element not found: #login".into());
        let out = r
            .reflect(
                ReflectionRequest {
                    instruction: "log in",
                    plan: std::slice::from_ref(&step),
                    step_index: 0,
                    failing_step: &step,
                    error: &err,
                    failed_result: None,
                    prior_results: &[],
                    device_pixel_ratio: None,
                },
                &ctx,
            )
            .await;
        assert!(matches!(out, ReflectionOutcome::Patched(ref p) if p.param_f64("x") == Some(640.0)));
        let calls = mock.calls();
        let user = &calls[0][1];
        assert_eq!(user.images.len(), 1);
        assert!(user.content.contains("device pixel ratio 2"));
    }

    #[tokio::test]
    async fn test_text_only_model_and_llm_error() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error("503");
        let r = reflector(mock.clone());
        let ctx = RunContext::detached(dir.path());
        let step = Step::new("file_read", "read", "").with_param("path", "__UNRESOLVED_REFERENCE__");
        let err = AgentError::UnresolvedReference {
            placeholders: vec!["{{step1.result.id}}".into()],
        };
        let prior = [StepResult::ok_with_data("made", json!({"name": "a"}))];
        let out = r
            .reflect(
                ReflectionRequest {
                    instruction: "read it",
                    plan: std::slice::from_ref(&step),
                    step_index: 1,
                    failing_step: &step,
                    error: &err,
                    failed_result: None,
                    prior_results: &prior,
                    device_pixel_ratio: None,
                },
                &ctx,
            )
            .await;
        assert!(matches!(out, ReflectionOutcome::RetryAsIs { .. }));
        let calls = mock.calls();
        assert!(calls[0][1].images.is_empty());
        assert!(calls[0][1].content.contains("step1: "));
        assert!(calls[0][1].content.contains("could not be resolved"));
    }
}

//! Fingerprint application and anti-detection overrides.
//!
//! Two layers, applied in order:
//! 1. CDP native emulation commands (user agent, device metrics, timezone,
//!    extra headers) - these never touch page JavaScript and are the least
//!    detectable.
//! 2. A new-document script that rewrites the read-only navigator/screen
//!    surface, hides the automation flag, substitutes the WebGL vendor
//!    strings, and perturbs canvas extraction.

use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::Page;

use crate::error::{EngineError, Result};
use crate::fingerprint::FingerprintProfile;

/// Chrome launch flags that suppress the automation tells.
pub fn anti_detection_args(window_width: u32, window_height: u32) -> Vec<String> {
    vec![
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-infobars".to_string(),
        "--disable-gpu".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-save-password-bubble".to_string(),
        "--disable-translate".to_string(),
        format!("--window-size={},{}", window_width, window_height),
    ]
}

/// Apply a fingerprint profile to a page: CDP overrides first, then the
/// new-document script so every navigation sees the spoofed surface.
pub async fn apply_fingerprint(page: &Page, profile: &FingerprintProfile) -> Result<()> {
    let user_agent = SetUserAgentOverrideParams::builder()
        .user_agent(&profile.user_agent)
        .accept_language(profile.accept_language())
        .platform(&profile.platform)
        .build()
        .map_err(EngineError::Cdp)?;
    page.execute(user_agent)
        .await
        .map_err(|e| EngineError::Cdp(format!("user agent override: {}", e)))?;

    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(profile.screen_width as i64)
        .height(profile.screen_height as i64)
        .device_scale_factor(1.0)
        .mobile(false)
        .screen_width(profile.screen_width as i64)
        .screen_height(profile.screen_height as i64)
        .build()
        .map_err(EngineError::Cdp)?;
    page.execute(metrics)
        .await
        .map_err(|e| EngineError::Cdp(format!("device metrics override: {}", e)))?;

    page.execute(SetTimezoneOverrideParams::new(profile.timezone.clone()))
        .await
        .map_err(|e| EngineError::Cdp(format!("timezone override: {}", e)))?;

    apply_baseline_headers(page, profile).await?;

    page.evaluate_on_new_document(build_override_script(profile))
        .await
        .map_err(|e| EngineError::Cdp(format!("stealth script injection: {}", e)))?;

    tracing::debug!(
        platform = %profile.platform,
        timezone = %profile.timezone,
        "fingerprint applied"
    );

    Ok(())
}

/// Baseline Accept/Accept-Language headers matching the profile languages.
pub async fn apply_baseline_headers(page: &Page, profile: &FingerprintProfile) -> Result<()> {
    let headers = Headers::new(serde_json::json!({
        "Accept": "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        "Accept-Language": profile.accept_language(),
    }));

    page.execute(SetExtraHttpHeadersParams::new(headers))
        .await
        .map_err(|e| EngineError::Cdp(format!("extra headers: {}", e)))?;
    Ok(())
}

/// The new-document override script. Runs before any page script, so the
/// platform's probes only ever see the spoofed values.
fn build_override_script(profile: &FingerprintProfile) -> String {
    let languages_json =
        serde_json::to_string(&profile.languages).unwrap_or_else(|_| "[\"en-US\"]".to_string());

    format!(
        r#"
// Automation flag must read as absent, not false
Object.defineProperty(navigator, 'webdriver', {{
  get: () => undefined,
  configurable: true
}});

Object.defineProperty(navigator, 'platform', {{
  get: () => '{platform}',
  configurable: true
}});

Object.defineProperty(navigator, 'language', {{
  get: () => '{language}',
  configurable: true
}});

Object.defineProperty(navigator, 'languages', {{
  get: () => {languages},
  configurable: true
}});

Object.defineProperty(navigator, 'hardwareConcurrency', {{
  get: () => {cores},
  configurable: true
}});

Object.defineProperty(navigator, 'deviceMemory', {{
  get: () => {memory},
  configurable: true
}});

Object.defineProperty(screen, 'width', {{ get: () => {width}, configurable: true }});
Object.defineProperty(screen, 'height', {{ get: () => {height}, configurable: true }});
Object.defineProperty(screen, 'availWidth', {{ get: () => {width}, configurable: true }});
Object.defineProperty(screen, 'availHeight', {{ get: () => {height} - 40, configurable: true }});
Object.defineProperty(screen, 'colorDepth', {{ get: () => {depth}, configurable: true }});
Object.defineProperty(screen, 'pixelDepth', {{ get: () => {depth}, configurable: true }});

// Plausible plugin list of the profile's length
const pluginNames = [
  ['Chrome PDF Plugin', 'internal-pdf-viewer'],
  ['Chrome PDF Viewer', 'mhjfbmdgcfjbbpaeojofohoefgiehjai'],
  ['Native Client', 'internal-nacl-plugin'],
  ['WebKit built-in PDF', 'webkit-pdf'],
  ['Chromium PDF Viewer', 'chromium-pdf-viewer'],
  ['Microsoft Edge PDF Viewer', 'edge-pdf-viewer']
];
Object.defineProperty(navigator, 'plugins', {{
  get: () => pluginNames.slice(0, {plugin_count}).map(([name, filename]) => ({{
    name, filename, description: 'Portable Document Format', length: 1
  }})),
  configurable: true
}});

// Notifications permission probe must not betray the headless default
const originalQuery = window.navigator.permissions.query;
window.navigator.permissions.query = function(parameters) {{
  if (parameters.name === 'notifications') {{
    return Promise.resolve({{ state: 'default', onchange: null }});
  }}
  return originalQuery.call(this, parameters);
}};

// WebGL vendor/renderer substitution (UNMASKED_VENDOR/RENDERER)
const getParameter = WebGLRenderingContext.prototype.getParameter;
WebGLRenderingContext.prototype.getParameter = function(parameter) {{
  if (parameter === 37445) return '{vendor}';
  if (parameter === 37446) return '{renderer}';
  return getParameter.apply(this, arguments);
}};
if (window.WebGL2RenderingContext) {{
  const getParameter2 = WebGL2RenderingContext.prototype.getParameter;
  WebGL2RenderingContext.prototype.getParameter = function(parameter) {{
    if (parameter === 37445) return '{vendor}';
    if (parameter === 37446) return '{renderer}';
    return getParameter2.apply(this, arguments);
  }};
}}

// Canvas noise: every channel of every pixel moves by at most +/-1 on
// extraction, which breaks the hash but is visually imperceptible.
const getImageData = CanvasRenderingContext2D.prototype.getImageData;

const perturb = (imageData) => {{
  for (let i = 0; i < imageData.data.length; i++) {{
    imageData.data[i] += Math.floor(Math.random() * 3) - 1;
  }}
  return imageData;
}};

CanvasRenderingContext2D.prototype.getImageData = function(...args) {{
  return perturb(getImageData.apply(this, args));
}};

// toDataURL/toBlob read pixels internally, so their noise is written back
// through the untouched original reader.
const addNoise = (context, width, height) => {{
  if (!context || width === 0 || height === 0) return;
  const imageData = perturb(getImageData.call(context, 0, 0, width, height));
  context.putImageData(imageData, 0, 0);
}};

const toDataURL = HTMLCanvasElement.prototype.toDataURL;
HTMLCanvasElement.prototype.toDataURL = function(...args) {{
  addNoise(this.getContext('2d'), this.width, this.height);
  return toDataURL.apply(this, args);
}};

const toBlob = HTMLCanvasElement.prototype.toBlob;
HTMLCanvasElement.prototype.toBlob = function(...args) {{
  addNoise(this.getContext('2d'), this.width, this.height);
  return toBlob.apply(this, args);
}};
"#,
        platform = profile.platform,
        language = profile.language,
        languages = languages_json,
        cores = profile.hardware_concurrency,
        memory = profile.device_memory,
        width = profile.screen_width,
        height = profile.screen_height,
        depth = profile.color_depth,
        plugin_count = profile.plugin_count,
        vendor = profile.webgl_vendor,
        renderer = profile.webgl_renderer,
    )
}

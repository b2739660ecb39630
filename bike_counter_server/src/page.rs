//! The upload page served at `/`.

use bike_counter::StatisticsSnapshot;

/// Form field carrying the uploaded video.
pub const VIDEO_FIELD: &str = "video";

#[derive(Debug, Default)]
pub struct PageView<'a> {
    /// Stored path of a video that was just uploaded.
    pub uploaded: Option<&'a str>,
    pub error: Option<&'a str>,
    pub stats: Option<StatisticsSnapshot>,
}

// Polls the statistics endpoint once per second while the feed is shown.
const POLL_JS: &str = r#"(function(){
    const set = (id, v) => { const el = document.getElementById(id); if (el) el.textContent = v; };
    async function poll(){
        try {
            const r = await fetch('/bike_count/', { cache: 'no-store' });
            const s = await r.json();
            set('count', s.count);
            set('fuel', s.fuel_saved.toFixed(2));
            set('calories', s.calories_burned.toFixed(2));
            set('carbon', s.carbon_reduction.toFixed(2));
        } catch (e) { console.warn(e); }
    }
    poll();
    setInterval(poll, 1000);
})();"#;

pub fn render(view: &PageView<'_>) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        r#"<form method="post" action="/" enctype="multipart/form-data">
    <input type="file" name="{VIDEO_FIELD}" accept="video/*">
    <button type="submit">Upload</button>
</form>
"#
    ));

    if let Some(error) = view.error {
        body.push_str(&format!(r#"<p class="error">{}</p>"#, escape_html(error)));
        body.push('\n');
    }

    if let Some(path) = view.uploaded {
        let stats = view.stats.unwrap_or_default();
        body.push_str(&format!(
            r#"<p>Uploaded: <code>{path}</code></p>
<img id="feed" src="/video_feed/" alt="live detection feed">
<table>
    <tr><th>Bicycle Count</th><td id="count">{count}</td></tr>
    <tr><th>Fuel Saved (PHP)</th><td id="fuel">{fuel:.2}</td></tr>
    <tr><th>Calories Burned (kcal)</th><td id="calories">{calories:.2}</td></tr>
    <tr><th>Carbon Reduction (kg)</th><td id="carbon">{carbon:.2}</td></tr>
</table>
<script>{POLL_JS}</script>
"#,
            path = escape_html(path),
            count = stats.count,
            fuel = stats.fuel_saved,
            calories = stats.calories_burned,
            carbon = stats.carbon_reduction,
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Bike Counter</title></head>
<body>
<h2>Bike Counter</h2>
{body}</body>
</html>
"#
    )
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

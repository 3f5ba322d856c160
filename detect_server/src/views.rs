//! HTML views.
//!
use std::collections::BTreeMap;

use crate::nn::Detection;

pub fn index_page() -> &'static str {
    r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Object Detection</title>
</head>
<body>
    <div class="container">
        <h3>Live Detection</h3>
        <button onclick="toggleCamera('on')">Camera on</button>
        <button onclick="toggleCamera('off')">Camera off</button>
        <div>
            <img id="feed" alt="Camera is off" width="100%">
        </div>

        <h3>Detect on an Image</h3>
        <form action="/detect" method="post" enctype="multipart/form-data">
            <p><input type="file" name="file" accept="image/*"></p>
            <p><input type="url" name="image_url" placeholder="or an image URL"></p>
            <p><button type="submit">Detect</button></p>
        </form>
    </div>
    <script>
        function toggleCamera(action) {
            const body = new URLSearchParams({ action });
            fetch("/toggle_camera", { method: "POST", body }).then(() => {
                const feed = document.getElementById("feed");
                feed.src = action === "on" ? "/video_feed?t=" + Date.now() : "";
            });
        }
    </script>
</body>
</html>
"#
}

/// Result page showing the annotated image at `image_path` below the static directory.
pub fn result_page(image_path: &str, version: u128, detections: &[Detection]) -> String {
    let summary = match detections.is_empty() {
        true => "No objects detected".to_owned(),
        false => format!(
            "{} objects detected: {}",
            detections.len(),
            escape_html(&summarize_detections(detections))
        ),
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Detection Result</title>
</head>
<body>
    <div class="container">
        <h3>Detection Result</h3>
        <p>{summary}</p>
        <img src="/static/{path}?v={version}" alt="Annotated image" width="100%">
        <p><a href="/">Back</a></p>
    </div>
</body>
</html>
"#,
        path = escape_html(image_path),
    )
}

/// Count detections per label, e.g. `2 person, 1 dog`.
pub fn summarize_detections(detections: &[Detection]) -> String {
    let mut counts = BTreeMap::new();
    for detection in detections {
        *counts.entry(detection.label.as_str()).or_insert(0) += 1;
    }

    counts
        .iter()
        .map(|(label, count)| format!("{count} {label}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

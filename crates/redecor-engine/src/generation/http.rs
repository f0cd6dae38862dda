use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::ImageFormat;
use redecor_contracts::config::Device;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tracing::debug;

use super::{GenerationEngine, GenerationRequest};
use crate::raster::OutputImage;

/// Forwards generation to a remote ControlNet inference server.
///
/// The server receives the conditioning image as a PNG multipart part next to
/// the text fields and answers with either raw `image/*` bytes or JSON that
/// carries base64 image data.
pub struct HttpEngine {
    endpoint: String,
    device: Device,
    width: u32,
    height: u32,
    http: HttpClient,
}

impl HttpEngine {
    pub fn new(
        endpoint: &str,
        device: Device,
        width: u32,
        height: u32,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            bail!("engine endpoint must be an http(s) URL, got '{endpoint}'");
        }
        let mut builder = HttpClient::builder();
        // reqwest's blocking default is 30s; generation can take far longer
        builder = builder.timeout(timeout);
        let http = builder.build().context("failed building engine http client")?;
        Ok(Self {
            endpoint,
            device,
            width,
            height,
            http,
        })
    }

    fn form_for(&self, request: &GenerationRequest) -> Result<MultipartForm> {
        let mut png = Vec::new();
        request
            .conditioning
            .as_rgb()
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("failed encoding conditioning image")?;
        let image_part = MultipartPart::bytes(png)
            .file_name("conditioning.png")
            .mime_str("image/png")?;
        Ok(MultipartForm::new()
            .text("prompt", request.prompt.clone())
            .text("negative_prompt", request.negative_prompt.clone())
            .text("seed", request.seed.to_string())
            .text("num_inference_steps", request.steps.to_string())
            .text("width", self.width.to_string())
            .text("height", self.height.to_string())
            .text("device", self.device.to_string())
            .part("image", image_part))
    }
}

impl GenerationEngine for HttpEngine {
    fn name(&self) -> &str {
        "http"
    }

    fn device(&self) -> Device {
        self.device
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<OutputImage> {
        let form = self.form_for(request)?;
        debug!(
            endpoint = %self.endpoint,
            steps = request.steps,
            seed = request.seed,
            "remote generation"
        );
        let response = self
            .http
            .post(&self.endpoint)
            .header("Accept", "image/*, application/json")
            .multipart(form)
            .send()
            .with_context(|| format!("engine request failed ({})", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "engine request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let bytes = if content_type.starts_with("image/") {
            response
                .bytes()
                .context("failed reading engine image bytes")?
                .to_vec()
        } else {
            let payload: Value = response
                .json()
                .context("failed parsing engine JSON response")?;
            decode_json_image(&payload)?
        };

        let decoded =
            image::load_from_memory(&bytes).context("engine returned undecodable image bytes")?;
        Ok(OutputImage::new(decoded.to_rgb8()))
    }
}

fn decode_json_image(payload: &Value) -> Result<Vec<u8>> {
    let encoded = payload
        .get("image")
        .or_else(|| payload.get("base64"))
        .or_else(|| {
            payload
                .get("images")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
        })
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("engine JSON response missing image data"))?;
    let encoded = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    BASE64
        .decode(encoded.as_bytes())
        .context("engine image base64 decode failed")
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use image::{Rgb, RgbImage};
    use serde_json::json;

    use super::*;
    use crate::raster::ConditioningImage;

    fn png_bytes(width: u32, height: u32) -> anyhow::Result<Vec<u8>> {
        let image = RgbImage::from_pixel(width, height, Rgb([12, 34, 56]));
        let mut buf = Vec::new();
        image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "a blue room".to_string(),
            negative_prompt: "no text".to_string(),
            conditioning: ConditioningImage::new(RgbImage::new(8, 8)),
            seed: 42,
            steps: 12,
        }
    }

    /// Serves exactly one request and hands its raw body back.
    fn one_shot_server(
        status_line: &'static str,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> anyhow::Result<(String, thread::JoinHandle<Vec<u8>>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}/generate", listener.local_addr()?);
        let handle = thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return Vec::new();
            };
            let mut reader = BufReader::new(stream);
            let mut content_length = 0usize;
            let mut chunked = false;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let lowered = line.to_ascii_lowercase();
                if let Some(value) = lowered.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
                if lowered.starts_with("transfer-encoding:") && lowered.contains("chunked") {
                    chunked = true;
                }
                if line == "\r\n" {
                    break;
                }
            }
            let mut received = Vec::new();
            if chunked {
                loop {
                    let mut size_line = String::new();
                    reader.read_line(&mut size_line).unwrap_or(0);
                    let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
                    let mut chunk = vec![0u8; size + 2];
                    if reader.read_exact(&mut chunk).is_err() || size == 0 {
                        break;
                    }
                    received.extend_from_slice(&chunk[..size]);
                }
            } else {
                received.resize(content_length, 0);
                let _ = reader.read_exact(&mut received);
            }

            let mut stream = reader.into_inner();
            let head = format!(
                "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
            received
        });
        Ok((url, handle))
    }

    #[test]
    fn posts_multipart_and_decodes_image_response() -> anyhow::Result<()> {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK", "image/png", png_bytes(16, 24)?)?;
        let mut engine = HttpEngine::new(&url, Device::Cuda, 16, 24, None)?;

        let output = engine.generate(&request())?;
        assert_eq!(output.dimensions(), (16, 24));
        assert_eq!(output.as_rgb().get_pixel(0, 0).0, [12, 34, 56]);

        let sent = String::from_utf8_lossy(
            &server
                .join()
                .map_err(|_| anyhow::anyhow!("server thread panicked"))?,
        )
        .to_string();
        assert!(sent.contains("name=\"prompt\""));
        assert!(sent.contains("a blue room"));
        assert!(sent.contains("name=\"num_inference_steps\""));
        assert!(sent.contains("name=\"device\""));
        assert!(sent.contains("cuda"));
        assert!(sent.contains("filename=\"conditioning.png\""));
        Ok(())
    }

    #[test]
    fn accepts_base64_json_response() -> anyhow::Result<()> {
        let encoded = BASE64.encode(png_bytes(4, 4)?);
        let body = serde_json::to_vec(&json!({
            "images": [format!("data:image/png;base64,{encoded}")]
        }))?;
        let (url, server) = one_shot_server("HTTP/1.1 200 OK", "application/json", body)?;
        let mut engine = HttpEngine::new(&url, Device::Cpu, 4, 4, None)?;

        let output = engine.generate(&request())?;
        assert_eq!(output.dimensions(), (4, 4));
        let _ = server.join();
        Ok(())
    }

    #[test]
    fn server_error_is_reported_with_status() -> anyhow::Result<()> {
        let (url, server) = one_shot_server(
            "HTTP/1.1 500 Internal Server Error",
            "text/plain",
            b"CUDA out of memory".to_vec(),
        )?;
        let mut engine = HttpEngine::new(&url, Device::Cuda, 4, 4, None)?;

        let err = engine.generate(&request()).err().map(|err| format!("{err:#}"));
        let _ = server.join();
        let message = err.unwrap_or_default();
        assert!(message.contains("500"));
        assert!(message.contains("CUDA out of memory"));
        Ok(())
    }

    #[test]
    fn rejects_non_http_endpoint() {
        assert!(HttpEngine::new("ftp://models", Device::Cpu, 8, 8, None).is_err());
    }

    #[test]
    fn json_without_image_is_an_error() {
        assert!(decode_json_image(&json!({"status": "ok"})).is_err());
    }
}

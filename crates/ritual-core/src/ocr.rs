//! Subject name extraction from the caption printed on anchor photos.
//!
//! Text recognition itself is delegated to a [`TextRecognizer`]; this module
//! owns the crop, the preprocessing and the parsing of what comes back.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::config::{MatchConfig, OcrRegion};
use crate::error::{Error, Result};

/// One line of recognized text.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedLine {
    pub text: String,
    /// 0.0..=1.0
    pub confidence: f32,
}

/// Text-from-image-region service.
pub trait TextRecognizer: Send + Sync {
    /// Lines in reading order.
    fn recognize(&self, region: &GrayImage) -> Result<Vec<RecognizedLine>>;
}

/// Runs the `tesseract` binary, reading its TSV output.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    pub language: String,
    /// Page segmentation mode; 6 = a single uniform block of text
    pub psm: u8,
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            psm: 6,
        }
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize(&self, region: &GrayImage) -> Result<Vec<RecognizedLine>> {
        let mut png = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(region.clone()).write_to(&mut png, ImageOutputFormat::Png)?;

        let mut command = Command::new("tesseract");
        command.args(["stdin", "stdout", "-l", &self.language, "--psm", &self.psm.to_string(), "tsv"]);
        let output = pipe_through(command, "tesseract", png.get_ref())?;
        parse_tsv(&output)
    }
}

/// Feed `input` to `command` on stdin and return its stdout. The child is
/// always waited for, even when it stops reading early.
fn pipe_through(mut command: Command, tool: &'static str, input: &[u8]) -> Result<Vec<u8>> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::tool(tool, e.to_string()))?;
    let written = match child.stdin.take() {
        // Dropping stdin closes the pipe
        Some(mut stdin) => stdin.write_all(input),
        None => Ok(()),
    };
    let output = child.wait_with_output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::tool(tool, stderr.trim().to_string()));
    }
    written.map_err(|e| Error::tool(tool, format!("writing input: {e}")))?;
    Ok(output.stdout)
}

/// Group the word rows (level 5) of tesseract TSV output into lines.
pub fn parse_tsv(tsv: &[u8]) -> Result<Vec<RecognizedLine>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .from_reader(tsv);

    let mut lines: Vec<((u32, u32, u32), Vec<String>, Vec<f32>)> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::tool("tesseract", format!("bad TSV: {e}")))?;
        let field = |i: usize| record.get(i).unwrap_or("").trim();
        if field(0) != "5" {
            continue;
        }
        let text = field(11);
        let conf: f32 = field(10).parse().unwrap_or(-1.0);
        if text.is_empty() || conf < 0.0 {
            continue;
        }
        let key = (
            field(2).parse().unwrap_or(0),
            field(3).parse().unwrap_or(0),
            field(4).parse().unwrap_or(0),
        );
        match lines.last_mut() {
            Some((last, words, confs)) if *last == key => {
                words.push(text.to_string());
                confs.push(conf);
            }
            _ => lines.push((key, vec![text.to_string()], vec![conf])),
        }
    }

    Ok(lines
        .into_iter()
        .map(|(_, words, confs)| RecognizedLine {
            text: words.join(" "),
            confidence: confs.iter().sum::<f32>() / confs.len() as f32 / 100.0,
        })
        .collect())
}

/// What the caption of an anchor photo says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameReading {
    /// Normalized: uppercase letters joined by `_`
    pub name: String,
    /// Second caption line, verbatim
    pub date_text: Option<String>,
    pub confidence: f32,
}

/// Normalize a recognized name line: `Chang, Chia-hao` -> `CHANG_CHIA_HAO`.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.nfkc() {
        if c.is_whitespace() || matches!(c, ',' | '-' | '\'' | '_') {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        } else if c.is_alphabetic() {
            out.extend(c.to_uppercase());
        }
    }
    out.trim_matches('_').to_string()
}

/// Interpret recognized lines as name + date text.
pub fn parse_reading(lines: &[RecognizedLine], threshold: f32) -> std::result::Result<NameReading, String> {
    let mut non_blank = lines.iter().filter(|l| !l.text.trim().is_empty());
    let name_line = non_blank.next().ok_or_else(|| "no text recognized".to_string())?;
    if name_line.confidence < threshold {
        return Err(format!(
            "name line '{}' confidence {:.2} below {:.2}",
            name_line.text.trim(),
            name_line.confidence,
            threshold
        ));
    }
    let name = normalize_name(&name_line.text);
    if name.is_empty() {
        return Err(format!("no letters in name line '{}'", name_line.text.trim()));
    }
    Ok(NameReading {
        name,
        date_text: non_blank.next().map(|l| l.text.trim().to_string()),
        confidence: name_line.confidence,
    })
}

/// Bottom-left corner of the photo as grayscale.
pub fn crop_caption(img: &DynamicImage, region: OcrRegion) -> GrayImage {
    let (w, h) = (img.width(), img.height());
    let cw = ((w as f32 * region.width_fraction).round() as u32).clamp(1, w.max(1));
    let ch = ((h as f32 * region.height_fraction).round() as u32).clamp(1, h.max(1));
    img.crop_imm(0, h.saturating_sub(ch), cw, ch).to_luma8()
}

/// Upscale 2x and binarize with Otsu's threshold; small caption text
/// recognizes far better that way.
pub fn prepare_for_ocr(gray: &GrayImage) -> GrayImage {
    let upscaled = imageops::resize(gray, gray.width() * 2, gray.height() * 2, FilterType::CatmullRom);
    let threshold = otsu_threshold(&upscaled);
    GrayImage::from_fn(upscaled.width(), upscaled.height(), |x, y| {
        Luma([if upscaled.get_pixel(x, y)[0] > threshold { 255 } else { 0 }])
    })
}

fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[usize::from(p[0])] += 1;
    }
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 127;
    }
    let sum_all: f64 = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();

    let (mut best, mut best_var) = (0u8, -1.0f64);
    let (mut weight_bg, mut sum_bg) = (0u64, 0.0f64);
    for (t, &count) in hist.iter().enumerate() {
        weight_bg += count;
        if weight_bg == 0 {
            continue;
        }
        let weight_fg = total - weight_bg;
        if weight_fg == 0 {
            break;
        }
        sum_bg += t as f64 * count as f64;
        let mean_bg = sum_bg / weight_bg as f64;
        let mean_fg = (sum_all - sum_bg) / weight_fg as f64;
        let between = weight_bg as f64 * weight_fg as f64 * (mean_bg - mean_fg).powi(2);
        if between > best_var {
            best_var = between;
            best = t as u8;
        }
    }
    best
}

/// Reads subject names off anchor photos.
pub struct OcrNameExtractor<'a> {
    recognizer: &'a dyn TextRecognizer,
    region: OcrRegion,
    threshold: f32,
    full_image_fallback: bool,
}

impl<'a> OcrNameExtractor<'a> {
    pub fn new(recognizer: &'a dyn TextRecognizer, config: &MatchConfig) -> Self {
        Self {
            recognizer,
            region: config.ocr_region,
            threshold: config.ocr_confidence_threshold,
            full_image_fallback: config.ocr_full_image_fallback,
        }
    }

    pub fn extract(&self, photo: &Path) -> Result<NameReading> {
        let img = image::open(photo)?;
        self.extract_from_image(photo, &img)
    }

    /// `path` is only used to label errors.
    pub fn extract_from_image(&self, path: &Path, img: &DynamicImage) -> Result<NameReading> {
        let caption = prepare_for_ocr(&crop_caption(img, self.region));
        let first = self.read(&caption);
        match first {
            Ok(reading) => Ok(reading),
            Err(detail) if self.full_image_fallback => {
                log::debug!("{}: caption region failed ({detail}), trying full image", path.display());
                self.read(&prepare_for_ocr(&img.to_luma8()))
                    .map_err(|detail| Error::OcrLowConfidence {
                        path: path.to_path_buf(),
                        detail,
                    })
            }
            Err(detail) => Err(Error::OcrLowConfidence {
                path: path.to_path_buf(),
                detail,
            }),
        }
    }

    fn read(&self, region: &GrayImage) -> std::result::Result<NameReading, String> {
        let lines = self.recognizer.recognize(region).map_err(|e| e.to_string())?;
        parse_reading(&lines, self.threshold)
    }
}

type RecognizeFn = Box<dyn Fn(&GrayImage) -> Vec<RecognizedLine> + Send + Sync>;

/// Returns canned lines, optionally depending on the image it is shown.
pub struct MockRecognizer {
    respond: RecognizeFn,
}

impl MockRecognizer {
    pub fn with_fn<F>(respond: F) -> Self
    where
        F: Fn(&GrayImage) -> Vec<RecognizedLine> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
        }
    }

    /// Always answers with `lines` as `(text, confidence)` pairs.
    pub fn with_lines(lines: &[(&str, f32)]) -> Self {
        let lines: Vec<RecognizedLine> = lines
            .iter()
            .map(|(text, confidence)| RecognizedLine {
                text: text.to_string(),
                confidence: *confidence,
            })
            .collect();
        Self::with_fn(move |_| lines.clone())
    }
}

impl TextRecognizer for MockRecognizer {
    fn recognize(&self, region: &GrayImage) -> Result<Vec<RecognizedLine>> {
        Ok((self.respond)(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, confidence: f32) -> RecognizedLine {
        RecognizedLine {
            text: text.to_string(),
            confidence,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_through_returns_stdout() {
        let out = pipe_through(Command::new("cat"), "cat", b"caption").unwrap();
        assert_eq!(out, b"caption");
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_through_reports_unread_input() {
        // `true` exits without reading, so the write hits a closed pipe
        let input = vec![0u8; 1 << 20];
        let err = pipe_through(Command::new("true"), "true", &input).unwrap_err();
        assert!(matches!(err, Error::Tool { tool: "true", .. }));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("CHANG CHIA HAO"), "CHANG_CHIA_HAO");
        assert_eq!(normalize_name("  LIN,HSI-TSUNG "), "LIN_HSI_TSUNG");
        assert_eq!(normalize_name("Chen   peiru"), "CHEN_PEIRU");
        assert_eq!(normalize_name("O'NEIL 1984."), "O_NEIL");
        assert_eq!(normalize_name("ＷＡＮＧ"), "WANG");
        assert_eq!(normalize_name("12/05"), "");
    }

    #[test]
    fn test_parse_reading_name_and_date() {
        let lines = [line("", 0.0), line("CHANG CHIA HAO", 0.91), line(" 113.01.31 ", 0.7)];
        let reading = parse_reading(&lines, 0.6).unwrap();
        assert_eq!(reading.name, "CHANG_CHIA_HAO");
        assert_eq!(reading.date_text.as_deref(), Some("113.01.31"));
    }

    #[test]
    fn test_parse_reading_rejects_low_confidence() {
        let err = parse_reading(&[line("CHANG CHIA HAO", 0.4)], 0.6).unwrap_err();
        assert!(err.contains("below"));
        assert!(parse_reading(&[line("--- 42", 0.9)], 0.6).is_err());
        assert!(parse_reading(&[], 0.6).is_err());
    }

    #[test]
    fn test_parse_tsv_groups_words_into_lines() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
                   4\t1\t1\t1\t1\t0\t0\t0\t100\t20\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t0\t0\t40\t20\t90\tCHANG\n\
                   5\t1\t1\t1\t1\t2\t40\t0\t40\t20\t80\tCHIA\n\
                   5\t1\t1\t1\t2\t1\t0\t30\t60\t20\t70\t113.01.31\n";
        let lines = parse_tsv(tsv.as_bytes()).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "CHANG CHIA");
        assert!((lines[0].confidence - 0.85).abs() < 1e-6);
        assert_eq!(lines[1].text, "113.01.31");
    }

    #[test]
    fn test_crop_caption_is_bottom_left() {
        // Bright bottom-left quadrant, dark elsewhere
        let img = DynamicImage::ImageLuma8(GrayImage::from_fn(100, 100, |x, y| {
            Luma([if x < 50 && y >= 50 { 200 } else { 10 }])
        }));
        let crop = crop_caption(
            &img,
            OcrRegion {
                width_fraction: 0.5,
                height_fraction: 0.35,
            },
        );
        assert_eq!(crop.dimensions(), (50, 35));
        assert!(crop.pixels().all(|p| p[0] == 200));
    }

    #[test]
    fn test_prepare_binarizes_and_upscales() {
        let gray = GrayImage::from_fn(10, 4, |x, _| Luma([if x < 5 { 30 } else { 220 }]));
        let prepared = prepare_for_ocr(&gray);
        assert_eq!(prepared.dimensions(), (20, 8));
        assert!(prepared.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(prepared.get_pixel(0, 0)[0], 0);
        assert_eq!(prepared.get_pixel(19, 0)[0], 255);
    }

    #[test]
    fn test_extractor_falls_back_to_full_image() {
        // Answers only for the full (larger) image
        let recognizer = MockRecognizer::with_fn(|img| {
            if img.width() > 100 {
                vec![line("WANG MEI", 0.9)]
            } else {
                vec![]
            }
        });
        let mut config = MatchConfig::default();
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(100, 100, Luma([128])));

        let reading = OcrNameExtractor::new(&recognizer, &config)
            .extract_from_image(Path::new("a.jpg"), &img)
            .unwrap();
        assert_eq!(reading.name, "WANG_MEI");

        config.ocr_full_image_fallback = false;
        let err = OcrNameExtractor::new(&recognizer, &config)
            .extract_from_image(Path::new("a.jpg"), &img)
            .unwrap_err();
        assert!(matches!(err, Error::OcrLowConfidence { .. }));
    }
}

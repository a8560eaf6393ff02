//! Saving and loading of learning data.
//!
//! Both encodings carry the same fields: a header with the counts, the descriptor
//! matrix, the keypoints, the object points, the training image records and,
//! optionally, the training images themselves. Loading validates everything before
//! the model is touched.

use crate::{ImageId, ReferenceModel, TrainingImageRecord};
use bincode::Options;
use image::GrayImage;
use itertools::Itertools;
use keypose_core::{
    DescriptorKind, DescriptorMatrix, Descriptors, Error, KeyPoint, ObjectPoint, Result,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::str::FromStr;

const MAGIC: [u8; 4] = *b"KPRM";
const TEXT_MAGIC: &str = "keypose-reference";
const VERSION: u32 = 1;

/// How learning data is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Encoding {
    /// Fixed width little-endian. Round-trips bit for bit.
    Binary,
    /// One record per line, human readable. Round-trips value for value.
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Header {
    magic: [u8; 4],
    version: u32,
    train_count: u64,
    descriptor_kind: Option<DescriptorKind>,
    descriptor_width: u64,
    has_points: bool,
    record_count: u64,
    image_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredRecord {
    id: ImageId,
    start: u64,
    len: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredImage {
    id: ImageId,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum StoredDescriptors {
    Binary(Vec<u8>),
    Float(Vec<f32>),
}

/// Everything that follows the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Body {
    descriptors: Option<StoredDescriptors>,
    keypoints: Vec<KeyPoint>,
    points: Vec<Option<[f64; 3]>>,
    records: Vec<StoredRecord>,
    images: Vec<StoredImage>,
}

fn corrupt(reason: impl Into<String>) -> Error {
    Error::CorruptFormat(reason.into())
}

fn bincode_options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(limit)
}

impl ReferenceModel {
    /// Writes the model to `path`, replacing the file.
    pub fn save(
        &self,
        path: impl AsRef<Path>,
        encoding: Encoding,
        include_images: bool,
    ) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer, encoding, include_images)?;
        writer.flush()?;
        info!(
            "saved {} training keypoints from {} images to {}",
            self.len(),
            self.image_count(),
            path.display()
        );
        Ok(())
    }

    /// Reads learning data from `path`.
    ///
    /// With `append`, the loaded training images are added under fresh ids and those
    /// ids are returned. Otherwise the model is replaced and keeps the ids found in
    /// the file. The model is unchanged when loading fails.
    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
        encoding: Encoding,
        append: bool,
    ) -> Result<Vec<ImageId>> {
        let path = path.as_ref();
        let loaded = Self::read_from(BufReader::new(File::open(path)?), encoding)?;
        let ids = if append {
            self.extend_from(loaded)?
        } else {
            let ids = loaded.records.iter().map(|r| r.id).collect();
            let next_image_id = self.next_image_id.max(loaded.next_image_id);
            *self = ReferenceModel {
                next_image_id,
                ..loaded
            };
            ids
        };
        info!(
            "loaded {} training images from {}, model now holds {} keypoints",
            ids.len(),
            path.display(),
            self.len()
        );
        Ok(ids)
    }

    /// Encodes the model into `writer`.
    pub fn write_to<W: Write>(
        &self,
        mut writer: W,
        encoding: Encoding,
        include_images: bool,
    ) -> Result<()> {
        let (header, body) = self.snapshot(include_images);
        match encoding {
            Encoding::Binary => {
                bincode_options(u64::MAX)
                    .serialize_into(&mut writer, &header)
                    .and_then(|_| bincode_options(u64::MAX).serialize_into(&mut writer, &body))
                    .map_err(|e| match *e {
                        bincode::ErrorKind::Io(e) => Error::Io(e),
                        other => corrupt(other.to_string()),
                    })
            }
            Encoding::Text => write_text(&mut writer, &header, &body),
        }
    }

    /// Decodes a model from `reader`.
    pub fn read_from<R: Read>(mut reader: R, encoding: Encoding) -> Result<Self> {
        let (header, body) = match encoding {
            Encoding::Binary => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                let limit = bytes.len() as u64;
                let mut input = bytes.as_slice();
                let header: Header = bincode_options(limit)
                    .deserialize_from(&mut input)
                    .map_err(|e| corrupt(format!("header: {}", e)))?;
                check_header(&header)?;
                let body: Body = bincode_options(limit)
                    .deserialize_from(&mut input)
                    .map_err(|e| corrupt(format!("body: {}", e)))?;
                (header, body)
            }
            Encoding::Text => read_text(BufReader::new(reader))?,
        };
        into_model(header, body)
    }

    fn snapshot(&self, include_images: bool) -> (Header, Body) {
        let descriptors = self.descriptors.as_ref().map(|d| match d {
            Descriptors::Binary(m) => StoredDescriptors::Binary(m.as_slice().to_vec()),
            Descriptors::Float(m) => StoredDescriptors::Float(m.as_slice().to_vec()),
        });
        let has_points = self.has_points();
        let points = if has_points {
            self.points
                .iter()
                .map(|p| p.map(|p| [p.x, p.y, p.z]))
                .collect()
        } else {
            Vec::new()
        };
        let records: Vec<StoredRecord> = self
            .records
            .iter()
            .map(|r| StoredRecord {
                id: r.id,
                start: r.range.start as u64,
                len: r.range.len() as u64,
            })
            .collect();
        let images: Vec<StoredImage> = if include_images {
            self.images
                .iter()
                .map(|(&id, image)| StoredImage {
                    id,
                    width: image.width(),
                    height: image.height(),
                    pixels: image.as_raw().clone(),
                })
                .collect()
        } else {
            Vec::new()
        };
        let header = Header {
            magic: MAGIC,
            version: VERSION,
            train_count: self.len() as u64,
            descriptor_kind: self.descriptors.as_ref().map(Descriptors::kind),
            descriptor_width: self.descriptors.as_ref().map_or(0, |d| d.width() as u64),
            has_points,
            record_count: records.len() as u64,
            image_count: images.len() as u64,
        };
        let body = Body {
            descriptors,
            keypoints: self.keypoints.clone(),
            points,
            records,
            images,
        };
        (header, body)
    }
}

fn check_header(header: &Header) -> Result<()> {
    if header.magic != MAGIC {
        return Err(corrupt("not a learning data file"));
    }
    if header.version != VERSION {
        return Err(corrupt(format!(
            "unsupported format version {}",
            header.version
        )));
    }
    Ok(())
}

fn check_count(what: &str, expected: u64, found: usize) -> Result<()> {
    if expected == found as u64 {
        Ok(())
    } else {
        Err(corrupt(format!(
            "header announces {} {}, found {}",
            expected, what, found
        )))
    }
}

/// Validates the decoded sections against the header and each other.
fn into_model(header: Header, body: Body) -> Result<ReferenceModel> {
    check_count("keypoints", header.train_count, body.keypoints.len())?;
    check_count("records", header.record_count, body.records.len())?;
    check_count("images", header.image_count, body.images.len())?;
    let train_count = body.keypoints.len();
    let width = header.descriptor_width as usize;

    let descriptors = match (header.descriptor_kind, body.descriptors) {
        (None, None) => {
            if train_count != 0 || !body.records.is_empty() {
                return Err(corrupt("training data without descriptors"));
            }
            None
        }
        (Some(DescriptorKind::Binary), Some(StoredDescriptors::Binary(data))) => {
            Some(Descriptors::from(descriptor_matrix(width, data)?))
        }
        (Some(DescriptorKind::Float), Some(StoredDescriptors::Float(data))) => {
            Some(Descriptors::from(descriptor_matrix(width, data)?))
        }
        _ => return Err(corrupt("descriptor type differs from the header")),
    };
    if let Some(descriptors) = &descriptors {
        check_count("descriptors", header.train_count, descriptors.len())?;
    }

    let points = if header.has_points {
        check_count("object points", header.train_count, body.points.len())?;
        body.points
            .into_iter()
            .map(|p| p.map(|[x, y, z]| ObjectPoint::new(x, y, z)))
            .collect()
    } else if body.points.is_empty() {
        vec![None; train_count]
    } else {
        return Err(corrupt("object points present but not announced"));
    };

    let mut records = Vec::with_capacity(body.records.len());
    let mut end = 0;
    for record in body.records {
        if record.start != end as u64 {
            return Err(corrupt(format!(
                "record {} starts at {}, expected {}",
                record.id, record.start, end
            )));
        }
        if records
            .last()
            .map_or(false, |last: &TrainingImageRecord| last.id >= record.id)
        {
            return Err(corrupt("image ids are not increasing"));
        }
        end = match record.start.checked_add(record.len) {
            Some(end) if end <= train_count as u64 => end as usize,
            _ => return Err(corrupt(format!("record {} exceeds the keypoints", record.id))),
        };
        records.push(TrainingImageRecord {
            id: record.id,
            range: record.start as usize..end,
        });
    }
    if end != train_count {
        return Err(corrupt("records do not cover every keypoint"));
    }

    let mut images = BTreeMap::new();
    for stored in body.images {
        if !records.iter().any(|r| r.id == stored.id) {
            return Err(corrupt(format!("image {} has no record", stored.id)));
        }
        let image = GrayImage::from_raw(stored.width, stored.height, stored.pixels)
            .ok_or_else(|| corrupt(format!("image {} pixel count", stored.id)))?;
        if images.insert(stored.id, image).is_some() {
            return Err(corrupt(format!("image {} stored twice", stored.id)));
        }
    }

    let next_image_id = match records.last() {
        Some(record) => record
            .id
            .checked_add(1)
            .ok_or_else(|| corrupt("image ids exhausted"))?,
        None => 0,
    };
    Ok(ReferenceModel {
        keypoints: body.keypoints,
        descriptors,
        points,
        records,
        images,
        next_image_id,
    })
}

fn descriptor_matrix<T: Copy>(width: usize, data: Vec<T>) -> Result<DescriptorMatrix<T>> {
    if width == 0 {
        return if data.is_empty() {
            Ok(DescriptorMatrix::new(0))
        } else {
            Err(corrupt("descriptor data with zero width"))
        };
    }
    DescriptorMatrix::from_vec(width, data).map_err(|e| corrupt(e.to_string()))
}

fn write_row<W: Write, T: Display>(
    writer: &mut W,
    keyword: &str,
    values: impl IntoIterator<Item = T>,
) -> Result<()> {
    let mut values = values.into_iter().peekable();
    if values.peek().is_none() {
        writeln!(writer, "{}", keyword)?;
    } else {
        writeln!(writer, "{} {}", keyword, values.join(" "))?;
    }
    Ok(())
}

fn write_text<W: Write>(writer: &mut W, header: &Header, body: &Body) -> Result<()> {
    let kind = match header.descriptor_kind {
        None => "none",
        Some(DescriptorKind::Binary) => "binary",
        Some(DescriptorKind::Float) => "float",
    };
    writeln!(writer, "{} {}", TEXT_MAGIC, header.version)?;
    writeln!(writer, "train {}", header.train_count)?;
    writeln!(writer, "descriptors {} {}", kind, header.descriptor_width)?;
    writeln!(writer, "points {}", header.has_points as u8)?;
    writeln!(writer, "records {}", header.record_count)?;
    writeln!(writer, "images {}", header.image_count)?;

    let width = (header.descriptor_width as usize).max(1);
    match &body.descriptors {
        Some(StoredDescriptors::Binary(data)) => {
            for row in data.chunks(width) {
                write_row(writer, "d", row)?;
            }
        }
        Some(StoredDescriptors::Float(data)) => {
            for row in data.chunks(width) {
                write_row(writer, "d", row)?;
            }
        }
        None => {}
    }
    for kp in &body.keypoints {
        writeln!(
            writer,
            "kp {} {} {} {} {} {} {}",
            kp.point.0, kp.point.1, kp.response, kp.size, kp.angle, kp.octave, kp.class_id
        )?;
    }
    for point in &body.points {
        match point {
            Some(p) => write_row(writer, "p", p)?,
            None => writeln!(writer, "p -")?,
        }
    }
    for record in &body.records {
        writeln!(writer, "record {} {} {}", record.id, record.start, record.len)?;
    }
    for image in &body.images {
        writeln!(writer, "image {} {} {}", image.id, image.width, image.height)?;
        for row in image.pixels.chunks(image.width.max(1) as usize) {
            write_row(writer, "px", row)?;
        }
    }
    Ok(())
}

/// Reads keyword-prefixed lines.
struct TextReader<R> {
    lines: std::io::Lines<R>,
    line: usize,
}

impl<R: BufRead> TextReader<R> {
    /// The fields of the next line, which must start with `keyword`.
    fn expect(&mut self, keyword: &str) -> Result<Vec<String>> {
        loop {
            self.line += 1;
            let line = match self.lines.next() {
                Some(line) => line?,
                None => {
                    return Err(corrupt(format!(
                        "unexpected end of file, expected `{}`",
                        keyword
                    )))
                }
            };
            let mut fields = line.split_whitespace();
            match fields.next() {
                None => continue,
                Some(found) if found == keyword => {
                    return Ok(fields.map(str::to_owned).collect())
                }
                Some(found) => {
                    return Err(corrupt(format!(
                        "line {}: expected `{}`, found `{}`",
                        self.line, keyword, found
                    )))
                }
            }
        }
    }

    fn expect_values<T: FromStr>(&mut self, keyword: &str, count: usize) -> Result<Vec<T>> {
        let fields = self.expect(keyword)?;
        if fields.len() != count {
            return Err(corrupt(format!(
                "line {}: `{}` needs {} values, found {}",
                self.line,
                keyword,
                count,
                fields.len()
            )));
        }
        fields.iter().map(|f| self.parse(f)).collect()
    }

    fn parse<T: FromStr>(&self, field: &str) -> Result<T> {
        field
            .parse()
            .map_err(|_| corrupt(format!("line {}: cannot parse `{}`", self.line, field)))
    }
}

fn read_text<R: BufRead>(reader: R) -> Result<(Header, Body)> {
    let mut text = TextReader {
        lines: reader.lines(),
        line: 0,
    };
    let version = text.expect_values::<u32>(TEXT_MAGIC, 1)?[0];
    let train_count = text.expect_values::<u64>("train", 1)?[0];
    let fields = text.expect("descriptors")?;
    let (descriptor_kind, descriptor_width) = match fields.as_slice() {
        [kind, width] => {
            let kind = match kind.as_str() {
                "none" => None,
                "binary" => Some(DescriptorKind::Binary),
                "float" => Some(DescriptorKind::Float),
                other => return Err(corrupt(format!("unknown descriptor type `{}`", other))),
            };
            (kind, text.parse::<u64>(width)?)
        }
        _ => return Err(corrupt("malformed descriptor header")),
    };
    let has_points = text.expect_values::<u8>("points", 1)?[0] != 0;
    let record_count = text.expect_values::<u64>("records", 1)?[0];
    let image_count = text.expect_values::<u64>("images", 1)?[0];
    let header = Header {
        magic: MAGIC,
        version,
        train_count,
        descriptor_kind,
        descriptor_width,
        has_points,
        record_count,
        image_count,
    };
    check_header(&header)?;

    let width = descriptor_width as usize;
    let descriptors = match descriptor_kind {
        None => None,
        Some(DescriptorKind::Binary) => Some(StoredDescriptors::Binary(read_rows(
            &mut text,
            train_count,
            width,
        )?)),
        Some(DescriptorKind::Float) => Some(StoredDescriptors::Float(read_rows(
            &mut text,
            train_count,
            width,
        )?)),
    };

    let mut keypoints = Vec::new();
    for _ in 0..train_count {
        let fields = text.expect("kp")?;
        let [x, y, response, size, angle, octave, class_id] = match fields.as_slice() {
            [a, b, c, d, e, f, g] => [a, b, c, d, e, f, g],
            _ => return Err(corrupt(format!("line {}: malformed keypoint", text.line))),
        };
        keypoints.push(KeyPoint {
            point: (text.parse(x)?, text.parse(y)?),
            response: text.parse(response)?,
            size: text.parse(size)?,
            angle: text.parse(angle)?,
            octave: text.parse(octave)?,
            class_id: text.parse(class_id)?,
        });
    }

    let mut points = Vec::new();
    if has_points {
        for _ in 0..train_count {
            let fields = text.expect("p")?;
            points.push(match fields.as_slice() {
                [absent] if absent == "-" => None,
                [x, y, z] => Some([text.parse(x)?, text.parse(y)?, text.parse(z)?]),
                _ => return Err(corrupt(format!("line {}: malformed point", text.line))),
            });
        }
    }

    let mut records = Vec::new();
    for _ in 0..record_count {
        let values = text.expect_values::<u64>("record", 3)?;
        let id = ImageId::try_from(values[0])
            .map_err(|_| corrupt(format!("line {}: image id out of range", text.line)))?;
        records.push(StoredRecord {
            id,
            start: values[1],
            len: values[2],
        });
    }

    let mut images = Vec::new();
    for _ in 0..image_count {
        let values = text.expect_values::<u32>("image", 3)?;
        let (id, width, height) = (values[0], values[1], values[2]);
        // Rows are only accumulated as they are read, whatever size the header announces.
        let mut pixels = Vec::new();
        if width > 0 {
            for _ in 0..height {
                pixels.extend(text.expect_values::<u8>("px", width as usize)?);
            }
        }
        images.push(StoredImage {
            id,
            width,
            height,
            pixels,
        });
    }

    let body = Body {
        descriptors,
        keypoints,
        points,
        records,
        images,
    };
    Ok((header, body))
}

fn read_rows<R: BufRead, T: FromStr>(
    text: &mut TextReader<R>,
    rows: u64,
    width: usize,
) -> Result<Vec<T>> {
    let mut data = Vec::new();
    for _ in 0..rows {
        data.extend(text.expect_values::<T>("d", width)?);
    }
    Ok(data)
}

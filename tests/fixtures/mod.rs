//! Test data: images and owning entities

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use std::io::Cursor;
use uuid::Uuid;

use studio_pipeline::models::entity::{OwnerRef, OwningEntity};

/// A small gradient PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 4 % 256) as u8, (y * 4 % 256) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

pub fn png_base64() -> String {
    STANDARD.encode(png_bytes(16, 16))
}

pub fn png_data_uri() -> String {
    format!("data:image/png;base64,{}", png_base64())
}

/// A freshly created subject with no assets.
pub fn subject(face_refs: &[&str], body_refs: &[&str]) -> OwningEntity {
    let id = Uuid::new_v4();
    OwningEntity {
        owner: OwnerRef::subject(id),
        subject_id: id,
        status: "queued".to_string(),
        prompt: None,
        settings: json!({}),
        face_refs: face_refs.iter().map(|s| s.to_string()).collect(),
        body_refs: body_refs.iter().map(|s| s.to_string()).collect(),
        asset_ids: Vec::new(),
        warnings: Vec::new(),
    }
}

pub fn photoshoot(parent: &OwningEntity, settings: Value) -> OwningEntity {
    OwningEntity {
        owner: OwnerRef::photoshoot(Uuid::new_v4()),
        subject_id: parent.subject_id,
        status: "queued".to_string(),
        prompt: Some("Beach editorial at golden hour".to_string()),
        settings,
        face_refs: parent.face_refs.clone(),
        body_refs: parent.body_refs.clone(),
        asset_ids: Vec::new(),
        warnings: Vec::new(),
    }
}

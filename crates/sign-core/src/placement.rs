use crate::coordinates::PdfPoint;
use crate::error::{SignError, SignResult};
use image::RgbaImage;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A signature image anchored (by its centre) at a point in page space.
#[derive(Clone)]
pub struct Placement {
    image: Arc<RgbaImage>,
    anchor: PdfPoint,
}

impl Placement {
    pub fn image(&self) -> &Arc<RgbaImage> {
        &self.image
    }

    pub fn anchor(&self) -> PdfPoint {
        self.anchor
    }
}

impl fmt::Debug for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placement")
            .field("image", &self.image.dimensions())
            .field("anchor", &self.anchor)
            .finish()
    }
}

/// At most one placement per page index. Inserting for an index replaces the previous entry.
#[derive(Debug, Clone, Default)]
pub struct PlacementStore {
    entries: BTreeMap<u32, Placement>,
}

impl PlacementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, page_index: u32, image: Arc<RgbaImage>, anchor: PdfPoint) -> SignResult<()> {
        ensure_drawable(&image)?;
        self.entries.insert(page_index, Placement { image, anchor });
        Ok(())
    }

    pub fn put_for_all_pages(
        &mut self,
        image: Arc<RgbaImage>,
        anchor: PdfPoint,
        page_count: u32,
    ) -> SignResult<()> {
        ensure_drawable(&image)?;
        for page_index in 0..page_count {
            self.entries.insert(page_index, Placement { image: Arc::clone(&image), anchor });
        }
        Ok(())
    }

    pub fn get(&self, page_index: u32) -> Option<&Placement> {
        self.entries.get(&page_index)
    }

    pub fn remove(&mut self, page_index: u32) -> Option<Placement> {
        self.entries.remove(&page_index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Placement)> {
        self.entries.iter().map(|(page, placement)| (*page, placement))
    }
}

fn ensure_drawable(image: &RgbaImage) -> SignResult<()> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(SignError::InvalidPlacement { width, height });
    }
    Ok(())
}

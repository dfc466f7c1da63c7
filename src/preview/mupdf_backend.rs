//! MuPDF-backed document engine

use mupdf::{Colorspace, Document, Matrix, Page, Pixmap};

use super::backend::{Backend, DocumentHandle, PageHandle};
use super::request::RenderFault;
use super::types::{PageSize, Surface};

const PDF_MAGIC: &str = "application/pdf";

#[derive(Clone, Copy, Debug, Default)]
pub struct MupdfBackend;

impl Backend for MupdfBackend {
    type Document = Document;

    fn open(&self, bytes: &[u8]) -> Result<Document, RenderFault> {
        Ok(Document::from_bytes(bytes, PDF_MAGIC)?)
    }
}

impl DocumentHandle for Document {
    type Page<'a> = Page;

    fn page_count(&self) -> Result<u32, RenderFault> {
        let count = Document::page_count(self)?;
        Ok(count.max(0) as u32)
    }

    fn load_page(&self, page: u32) -> Result<Page, RenderFault> {
        let page_count = DocumentHandle::page_count(self)?;
        if page == 0 || page > page_count {
            return Err(RenderFault::PageOutOfRange { page, page_count });
        }
        Ok(Document::load_page(self, page as i32 - 1)?)
    }
}

impl PageHandle for Page {
    fn size(&self) -> Result<PageSize, RenderFault> {
        let bounds = self.bounds()?;
        Ok(PageSize {
            width: bounds.x1 - bounds.x0,
            height: bounds.y1 - bounds.y0,
        })
    }

    fn rasterize(&self, surface: &mut Surface, scale: f32) -> Result<(), RenderFault> {
        let pixmap = self.to_pixmap(
            &Matrix::new_scale(scale, scale),
            &Colorspace::device_rgb(),
            false,
            false,
        )?;
        copy_pixmap(&pixmap, surface)
    }
}

/// Copy the overlapping region of `pixmap` into `surface`, dropping any
/// channels past RGB. Rounding can leave the two a pixel apart.
fn copy_pixmap(pixmap: &Pixmap, surface: &mut Surface) -> Result<(), RenderFault> {
    let n = pixmap.n() as usize;
    if n < 3 {
        return Err(RenderFault::generic(format!(
            "Unsupported pixmap format: {n} channels"
        )));
    }

    let src_width = pixmap.width() as usize;
    let src_height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    if samples.len() < stride.saturating_mul(src_height) || src_width * n > stride {
        return Err(RenderFault::generic("Pixmap buffer size mismatch"));
    }

    let width = src_width.min(surface.width as usize);
    let height = src_height.min(surface.height as usize);
    let dst_stride = surface.width as usize * 3;

    for y in 0..height {
        let src = &samples[y * stride..y * stride + width * n];
        let dst = &mut surface.pixels[y * dst_stride..y * dst_stride + width * 3];
        if n == 3 {
            dst.copy_from_slice(src);
        } else {
            for (out, px) in dst.chunks_exact_mut(3).zip(src.chunks_exact(n)) {
                out.copy_from_slice(&px[..3]);
            }
        }
    }

    Ok(())
}

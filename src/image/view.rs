//! Borrowed rectangular sub-regions of image buffers.
//!
//! Pipeline stages take [`ImageView`]s for input and [`ImageViewMut`]s for
//! output; the views stay valid for as long as the borrow of the backing
//! buffer does, which the borrow checker enforces for us.

use super::buffer::{row_as, row_as_mut, PixelBuffer};
use super::format::PixelFormat;
use super::Rect;

/// Immutable view of a rectangular fragment of a buffer.
pub struct ImageView<'a> {
    buf: &'a dyn PixelBuffer,
    rect: Rect,
}

impl<'a> ImageView<'a> {
    pub fn new(buf: &'a dyn PixelBuffer, rect: Rect) -> ImageView<'a> {
        debug_assert!(rect.x + rect.width as i32 <= buf.width() as i32);
        debug_assert!(rect.y + rect.height as i32 <= buf.height() as i32);
        debug_assert!(rect.x >= 0 && rect.y >= 0);
        ImageView { buf, rect }
    }

    pub fn full(buf: &'a dyn PixelBuffer) -> ImageView<'a> {
        let rect = Rect { x: 0, y: 0, width: buf.width(), height: buf.height() };
        ImageView { buf, rect }
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.buf.pixel_format()
    }

    /// Raw bytes of view row `r`.
    pub fn row(&self, r: u32) -> &[u8] {
        debug_assert!(r < self.rect.height);
        let bpp = self.buf.bytes_per_pixel();
        let full = self.buf.row(r + self.rect.y as u32);
        &full[self.rect.x as usize * bpp..(self.rect.x as usize + self.rect.width as usize) * bpp]
    }

    /// View row `r` as a typed channel slice.
    pub fn row_as<T: bytemuck::Pod>(&self, r: u32) -> &[T] {
        row_as(self.row(r))
    }
}

/// Mutable view of a rectangular fragment of a buffer.
pub struct ImageViewMut<'a> {
    buf: &'a mut dyn PixelBuffer,
    rect: Rect,
}

impl<'a> ImageViewMut<'a> {
    pub fn new(buf: &'a mut dyn PixelBuffer, rect: Rect) -> ImageViewMut<'a> {
        debug_assert!(rect.x + rect.width as i32 <= buf.width() as i32);
        debug_assert!(rect.y + rect.height as i32 <= buf.height() as i32);
        debug_assert!(rect.x >= 0 && rect.y >= 0);
        ImageViewMut { buf, rect }
    }

    pub fn full(buf: &'a mut dyn PixelBuffer) -> ImageViewMut<'a> {
        let rect = Rect { x: 0, y: 0, width: buf.width(), height: buf.height() };
        ImageViewMut { buf, rect }
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.buf.pixel_format()
    }

    pub fn row(&self, r: u32) -> &[u8] {
        debug_assert!(r < self.rect.height);
        let bpp = self.buf.bytes_per_pixel();
        let full = self.buf.row(r + self.rect.y as u32);
        &full[self.rect.x as usize * bpp..(self.rect.x as usize + self.rect.width as usize) * bpp]
    }

    pub fn row_mut(&mut self, r: u32) -> &mut [u8] {
        debug_assert!(r < self.rect.height);
        let bpp = self.buf.bytes_per_pixel();
        let x = self.rect.x as usize;
        let w = self.rect.width as usize;
        let full = self.buf.row_mut(r + self.rect.y as u32);
        &mut full[x * bpp..(x + w) * bpp]
    }

    pub fn row_as<T: bytemuck::Pod>(&self, r: u32) -> &[T] {
        row_as(self.row(r))
    }

    pub fn row_as_mut<T: bytemuck::Pod>(&mut self, r: u32) -> &mut [T] {
        row_as_mut(self.row_mut(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::buffer::SimpleBuffer;

    #[test]
    fn view_offsets_into_buffer() {
        let mut buf = SimpleBuffer::new(4, 3, PixelFormat::Mono8);
        for r in 0..3 {
            for c in 0..4usize {
                buf.row_mut(r)[c] = (10 * r as usize + c) as u8;
            }
        }
        let view = ImageView::new(&buf, Rect { x: 1, y: 1, width: 2, height: 2 });
        assert_eq!(view.row(0), &[11, 12]);
        assert_eq!(view.row(1), &[21, 22]);
    }

    #[test]
    fn mut_view_writes_through() {
        let mut buf = SimpleBuffer::new(3, 2, PixelFormat::Mono8);
        {
            let mut view = ImageViewMut::new(&mut buf, Rect { x: 2, y: 0, width: 1, height: 2 });
            view.row_mut(0)[0] = 42;
            view.row_mut(1)[0] = 43;
        }
        assert_eq!(buf.row(0)[2], 42);
        assert_eq!(buf.row(1)[2], 43);
    }
}

//! Pixel buffer storage.
//!
//! Buffers expose a row-oriented byte interface so the rest of the crate
//! never needs to know whether rows are padded or stored bottom-up.

use super::format::{Palette, PixelFormat};

/// Capability set of a pixel storage backing an [`super::Image`].
pub trait PixelBuffer: Send + Sync {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn pixel_format(&self) -> PixelFormat;

    /// Stride in bytes between the starts of consecutive logical rows.
    /// At least `width * bytes_per_pixel`.
    fn bytes_per_row(&self) -> usize;

    fn bytes_per_pixel(&self) -> usize {
        self.pixel_format().bytes_per_pixel()
    }

    /// Raw bytes of logical row `r` (`r = 0` is the top row).
    fn row(&self, r: u32) -> &[u8];

    /// Mutable raw bytes of logical row `r`.
    fn row_mut(&mut self, r: u32) -> &mut [u8];

    /// Deep copy into a contiguous buffer.
    fn duplicate(&self) -> SimpleBuffer;

    fn palette(&self) -> Option<&Palette> {
        None
    }

    fn palette_mut(&mut self) -> Option<&mut Palette> {
        None
    }
}

/// Contiguous buffer without row padding; rows stored top to bottom.
pub struct SimpleBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    palette: Option<Palette>,
}

impl SimpleBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> SimpleBuffer {
        let row_len = width as usize * format.bytes_per_pixel();
        SimpleBuffer {
            width,
            height,
            format,
            data: vec![0; row_len * height as usize],
            palette: (format == PixelFormat::Pal8).then(Palette::gray_ramp),
        }
    }

    pub fn from_data(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> SimpleBuffer {
        assert_eq!(data.len(), width as usize * format.bytes_per_pixel() * height as usize);
        SimpleBuffer {
            width,
            height,
            format,
            data,
            palette: (format == PixelFormat::Pal8).then(Palette::gray_ramp),
        }
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = Some(palette);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl PixelBuffer for SimpleBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn bytes_per_row(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    fn row(&self, r: u32) -> &[u8] {
        debug_assert!(r < self.height);
        let stride = self.bytes_per_row();
        &self.data[r as usize * stride..(r as usize + 1) * stride]
    }

    fn row_mut(&mut self, r: u32) -> &mut [u8] {
        debug_assert!(r < self.height);
        let stride = self.bytes_per_row();
        &mut self.data[r as usize * stride..(r as usize + 1) * stride]
    }

    fn duplicate(&self) -> SimpleBuffer {
        SimpleBuffer {
            width: self.width,
            height: self.height,
            format: self.format,
            data: self.data.clone(),
            palette: self.palette.clone(),
        }
    }

    fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    fn palette_mut(&mut self) -> Option<&mut Palette> {
        self.palette.as_mut()
    }
}

/// Buffer in foreign bitmap layout: rows padded to a stride and stored
/// bottom-up physically. `row()` presents them in logical top-down order.
pub struct PaddedBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    data: Vec<u8>,
    palette: Option<Palette>,
}

impl PaddedBuffer {
    /// Wraps raw bottom-up data. `stride >= width * bytes_per_pixel`.
    pub fn from_bottom_up(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
        data: Vec<u8>,
    ) -> PaddedBuffer {
        assert!(stride >= width as usize * format.bytes_per_pixel());
        assert!(data.len() >= stride * height as usize);
        PaddedBuffer {
            width,
            height,
            format,
            stride,
            data,
            palette: (format == PixelFormat::Pal8).then(Palette::gray_ramp),
        }
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = Some(palette);
    }

    // Physical offset of logical row `r`; the bottom-up flip lives here.
    fn row_offset(&self, r: u32) -> usize {
        (self.height - 1 - r) as usize * self.stride
    }
}

impl PixelBuffer for PaddedBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn bytes_per_row(&self) -> usize {
        self.stride
    }

    fn row(&self, r: u32) -> &[u8] {
        debug_assert!(r < self.height);
        let ofs = self.row_offset(r);
        &self.data[ofs..ofs + self.width as usize * self.format.bytes_per_pixel()]
    }

    fn row_mut(&mut self, r: u32) -> &mut [u8] {
        debug_assert!(r < self.height);
        let ofs = self.row_offset(r);
        let len = self.width as usize * self.format.bytes_per_pixel();
        &mut self.data[ofs..ofs + len]
    }

    fn duplicate(&self) -> SimpleBuffer {
        let mut copy = SimpleBuffer::new(self.width, self.height, self.format);
        for r in 0..self.height {
            copy.row_mut(r).copy_from_slice(self.row(r));
        }
        if let (Some(dest), Some(src)) = (copy.palette_mut(), self.palette()) {
            *dest = src.clone();
        }
        copy
    }

    fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    fn palette_mut(&mut self) -> Option<&mut Palette> {
        self.palette.as_mut()
    }
}

/// Reinterprets a row of bytes as a typed pixel slice.
pub(crate) fn row_as<T: bytemuck::Pod>(row: &[u8]) -> &[T] {
    bytemuck::cast_slice(row)
}

pub(crate) fn row_as_mut<T: bytemuck::Pod>(row: &mut [u8]) -> &mut [T] {
    bytemuck::cast_slice_mut(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_buffer_rows() {
        let mut buf = SimpleBuffer::new(3, 2, PixelFormat::Mono8);
        buf.row_mut(0).copy_from_slice(&[1, 2, 3]);
        buf.row_mut(1).copy_from_slice(&[4, 5, 6]);
        assert_eq!(buf.row(0), &[1, 2, 3]);
        assert_eq!(buf.row(1), &[4, 5, 6]);
        assert_eq!(buf.bytes_per_row(), 3);
    }

    #[test]
    fn padded_buffer_hides_bottom_up_layout() {
        // 2x2 MONO8 with stride 4, physically bottom-up:
        // physical row 0 = logical row 1
        let data = vec![
            10, 11, 0, 0, // logical row 1
            20, 21, 0, 0, // logical row 0
        ];
        let buf = PaddedBuffer::from_bottom_up(2, 2, PixelFormat::Mono8, 4, data);
        assert_eq!(buf.row(0), &[20, 21]);
        assert_eq!(buf.row(1), &[10, 11]);

        let copy = buf.duplicate();
        assert_eq!(copy.row(0), &[20, 21]);
        assert_eq!(copy.row(1), &[10, 11]);
        assert_eq!(copy.bytes_per_row(), 2);
    }

    #[test]
    fn typed_row_views() {
        let mut buf = SimpleBuffer::new(2, 1, PixelFormat::Mono32f);
        row_as_mut::<f32>(buf.row_mut(0)).copy_from_slice(&[0.25, 0.75]);
        assert_eq!(row_as::<f32>(buf.row(0)), &[0.25, 0.75]);
    }
}

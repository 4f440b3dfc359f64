use std::ops::{Deref, DerefMut, Index, IndexMut};

/// Axis-aligned pixel rectangle. `x`/`y` may be negative for regions that
/// start outside a buffer; use [`Rect::clip`] before touching pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i64,
    pub y: i64,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: i64, y: i64, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    pub fn right(&self) -> i64 {
        self.x + self.width as i64
    }

    #[inline]
    pub fn bottom(&self) -> i64 {
        self.y + self.height as i64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize))
    }

    /// Smallest rectangle covering both. Empty rectangles are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Rect::new(x0, y0, (x1 - x0) as usize, (y1 - y0) as usize)
    }

    /// Restricts the rectangle to a `width` x `height` buffer.
    pub fn clip(&self, width: usize, height: usize) -> Option<Rect> {
        self.intersect(&Rect::new(0, 0, width, height))
    }
}

/// Row-major 2-D pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer2<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> Buffer2<T> {
    pub fn new(width: usize, height: usize, pixels: Vec<T>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixels length must equal width * height"
        );
        Self {
            pixels,
            width,
            height,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> &T {
        debug_assert!(x < self.width && y < self.height);
        &self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        let start = y * self.width;
        &self.pixels[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, y: usize) -> &mut [T] {
        let start = y * self.width;
        &mut self.pixels[start..start + self.width]
    }
}

impl<T: Clone> Buffer2<T> {
    pub fn new_filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }

    #[inline]
    pub fn fill(&mut self, value: T) {
        self.pixels.fill(value);
    }

    /// Fills the part of `rect` that lies inside the buffer.
    pub fn fill_rect(&mut self, rect: Rect, value: T) {
        let Some(clipped) = rect.clip(self.width, self.height) else {
            return;
        };
        let x0 = clipped.x as usize;
        for y in clipped.y as usize..clipped.bottom() as usize {
            self.row_mut(y)[x0..x0 + clipped.width].fill(value.clone());
        }
    }
}

impl<T: Copy> Buffer2<T> {
    /// Draws `src` with its top-left corner at `(dst_x, dst_y)`, restricted to
    /// `region` (in destination coordinates). `f` maps source to destination
    /// pixels. Returns the rectangle actually written.
    pub fn blit_map<S: Copy>(
        &mut self,
        src: &Buffer2<S>,
        dst_x: i64,
        dst_y: i64,
        region: Rect,
        f: impl Fn(S) -> T,
    ) -> Option<Rect> {
        let placed = Rect::new(dst_x, dst_y, src.width, src.height);
        let target = placed
            .intersect(&region)?
            .clip(self.width, self.height)?;

        let src_x0 = (target.x - dst_x) as usize;
        let dst_x0 = target.x as usize;
        for y in target.y..target.bottom() {
            let src_row = &src.row((y - dst_y) as usize)[src_x0..src_x0 + target.width];
            let dst_row = &mut self.row_mut(y as usize)[dst_x0..dst_x0 + target.width];
            for (d, s) in dst_row.iter_mut().zip(src_row) {
                *d = f(*s);
            }
        }
        Some(target)
    }
}

impl<T> Index<(usize, usize)> for Buffer2<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

impl<T> IndexMut<(usize, usize)> for Buffer2<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        &mut self.pixels[y * self.width + x]
    }
}

impl<T> Deref for Buffer2<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.pixels
    }
}

impl<T> DerefMut for Buffer2<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.pixels
    }
}

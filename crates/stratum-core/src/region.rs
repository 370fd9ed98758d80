/// Region of interest: the rectangle of the full frame one executor call covers.
///
/// `x`/`y` locate the region in full-frame coordinates at `scale`. Buffers
/// handed to executors are region-sized, so pixel `(0, 0)` of a buffer is
/// pixel `(x, y)` of the frame. Regions at different scales live in
/// different coordinate systems and never contain one another.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale: 1.0,
        }
    }

    /// The whole frame of a `width`x`height` image.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn with_scale(self, scale: f32) -> Self {
        Self { scale, ..self }
    }

    /// True when `other` lies entirely inside `self` at the same scale.
    pub fn contains(&self, other: &Roi) -> bool {
        other.scale == self.scale
            && other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Split into a left part `at` columns wide and the remaining right part.
    pub fn split_columns(&self, at: u32) -> (Roi, Roi) {
        let at = at.min(self.width);
        let left = Roi {
            width: at,
            ..*self
        };
        let right = Roi {
            x: self.x + at,
            width: self.width - at,
            ..*self
        };
        (left, right)
    }

    /// Split into a top part `at` rows high and the remaining bottom part.
    pub fn split_rows(&self, at: u32) -> (Roi, Roi) {
        let at = at.min(self.height);
        let top = Roi {
            height: at,
            ..*self
        };
        let bottom = Roi {
            y: self.y + at,
            height: self.height - at,
            ..*self
        };
        (top, bottom)
    }

    /// Cover the region with tiles of at most `tile`x`tile` pixels, row-major.
    pub fn tiles(&self, tile: u32) -> Vec<Roi> {
        let tile = tile.max(1);
        let mut out = Vec::new();
        let mut y = self.y;
        while y < self.bottom() {
            let h = tile.min(self.bottom() - y);
            let mut x = self.x;
            while x < self.right() {
                let w = tile.min(self.right() - x);
                out.push(Roi {
                    x,
                    y,
                    width: w,
                    height: h,
                    scale: self.scale,
                });
                x += w;
            }
            y += h;
        }
        out
    }
}

//! Rectangles and rectangle sets in output-local pixel coordinates

/// Axis-aligned rectangle; empty if width or height is not positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    #[inline]
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    #[inline]
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        let rect = Rect::new(x0, y0, x1 - x0, y1 - y0);
        (!rect.is_empty()).then_some(rect)
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && y >= self.y && x < self.right() && y < self.bottom()
    }

    /// Smallest rectangle covering both
    pub fn merge(&self, other: &Rect) -> Rect {
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
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Parts of `self` not covered by `other` (at most 4 disjoint pieces)
    ///
    /// Full-width bands above and below the overlap, then the left and
    /// right remainders inside the overlap's rows.
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(overlap) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };

        let mut pieces = Vec::with_capacity(4);
        let bands = [
            Rect::new(self.x, self.y, self.width, overlap.y - self.y),
            Rect::new(self.x, overlap.bottom(), self.width, self.bottom() - overlap.bottom()),
            Rect::new(self.x, overlap.y, overlap.x - self.x, overlap.height),
            Rect::new(overlap.right(), overlap.y, self.right() - overlap.right(), overlap.height),
        ];
        pieces.extend(bands.into_iter().filter(|r| !r.is_empty()));
        pieces
    }
}

/// Rectangles above this count collapse into their bounding box
const MAX_RECTS: usize = 32;

/// Union of rectangles, stored as disjoint pieces
///
/// May over-approximate once it grows past a fixed number of pieces;
/// it never under-approximates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add_rect(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Empty the region, keeping its allocation
    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Covered pixel count (pieces are disjoint)
    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Bounding box, None if empty
    pub fn extents(&self) -> Option<Rect> {
        self.rects.iter().copied().reduce(|acc, r| acc.merge(&r))
    }

    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }

        // Keep pieces disjoint: only add what isn't covered yet
        let mut fresh = vec![rect];
        for existing in &self.rects {
            fresh = fresh.iter().flat_map(|piece| piece.subtract(existing)).collect();
            if fresh.is_empty() {
                return;
            }
        }
        self.rects.extend(fresh);

        if self.rects.len() > MAX_RECTS {
            if let Some(extents) = self.extents() {
                self.rects.clear();
                self.rects.push(extents);
            }
        }
    }

    pub fn union_with(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    /// Whether every pixel of `rect` is in the region
    pub fn contains_rect(&self, rect: &Rect) -> bool {
        let mut remaining = vec![*rect];
        for existing in &self.rects {
            remaining = remaining
                .iter()
                .flat_map(|piece| piece.subtract(existing))
                .collect();
            if remaining.is_empty() {
                return true;
            }
        }
        remaining.iter().all(Rect::is_empty)
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }

    /// Drop everything outside `bounds`
    pub fn clip(&mut self, bounds: &Rect) {
        self.rects = self
            .rects
            .iter()
            .filter_map(|r| r.intersection(bounds))
            .collect();
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

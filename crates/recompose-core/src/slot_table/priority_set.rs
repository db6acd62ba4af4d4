/// Max-heap of group indices with lazy duplicate removal.
///
/// Used to recompute `contains_mark` bottom-up: taking the largest index first
/// guarantees every child is settled before its parent.
#[derive(Debug, Default)]
pub(crate) struct PrioritySet {
    list: Vec<usize>,
}

impl PrioritySet {
    pub(crate) fn add(&mut self, value: usize) {
        // trivial duplicates
        if let (Some(&first), Some(&last)) = (self.list.first(), self.list.last()) {
            if first == value || last == value {
                return;
            }
        }
        let mut index = self.list.len();
        self.list.push(value);
        while index > 0 {
            let parent = ((index + 1) >> 1) - 1;
            let parent_value = self.list[parent];
            if value > parent_value {
                self.list[index] = parent_value;
            } else {
                break;
            }
            index = parent;
        }
        self.list[index] = value;
    }

    pub(crate) fn peek(&self) -> Option<usize> {
        self.list.first().copied()
    }

    /// Removes the maximum along with any duplicates of it.
    pub(crate) fn take_max(&mut self) -> Option<usize> {
        let value = *self.list.first()?;
        while self.list.first() == Some(&value) {
            let last = self.list.len() - 1;
            self.list.swap(0, last);
            self.list.pop();
            self.sift_down();
        }
        Some(value)
    }

    fn sift_down(&mut self) {
        let size = self.list.len();
        let mut index = 0;
        loop {
            let left = index * 2 + 1;
            let right = left + 1;
            let mut largest = index;
            if left < size && self.list[left] > self.list[largest] {
                largest = left;
            }
            if right < size && self.list[right] > self.list[largest] {
                largest = right;
            }
            if largest == index {
                break;
            }
            self.list.swap(index, largest);
            index = largest;
        }
    }
}

//! Intrusive circular doubly linked list whose elements live in a container
//! implementing `core::ops::Index`.
//!
//! The list never owns its elements. Links are stored in cells embedded in the
//! elements, and every access to a cell goes through a key (e.g., a lock token)
//! supplied to [`ListAccessorCell`].
use core::{fmt, ops};

/// Circular linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index> Default for ListHead<Index> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self { first: None }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// A cell-like storage whose content can be read or written by presenting a
/// key.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

/// An error type indicating inconsistency in a linked list structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InconsistentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    AlreadyLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for InsertError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemError {
    NotLinked,
    Inconsistent(InconsistentError),
}

impl From<InconsistentError> for ItemError {
    #[inline(always)]
    fn from(x: InconsistentError) -> Self {
        Self::Inconsistent(x)
    }
}

/// `Cell`-based accessor to a linked list.
#[derive(Debug)]
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    /// `Key` used to read or write cells.
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    fn link_of(&self, i: Index) -> Option<Link<Index>> {
        (self.map_link)(&self.pool[i]).get(&self.cell_key)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    #[inline]
    pub fn front(&self) -> Result<Option<Index>, InconsistentError> {
        Ok(self.head().first)
    }

    #[cfg(test)]
    pub fn back(&self) -> Result<Option<Index>, InconsistentError> {
        self.head()
            .first
            .map(|p| Ok(self.link_of(p).ok_or(InconsistentError)?.prev))
            .transpose()
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) -> Result<(), InsertError> {
        if self.link_of(item.clone()).is_some() {
            return Err(InsertError::AlreadyLinked);
        }

        let mut head = self.head();

        let Some(first) = head.first.clone() else {
            debug_assert!(at.is_none());

            (self.map_link)(&self.pool[item.clone()]).set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
            return Ok(());
        };

        let (next, update_first) = match at {
            Some(at) => {
                let update_first = at == first;
                (at, update_first)
            }
            None => (first, false),
        };

        let prev = self.link_of(next.clone()).ok_or(InconsistentError)?.prev;

        // prev.next = item
        (self.map_link)(&self.pool[prev.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => {
                l.next = item.clone();
                Ok(())
            }
            None => Err(InconsistentError),
        })?;

        // next.prev = item
        (self.map_link)(&self.pool[next.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => {
                l.prev = item.clone();
                Ok(())
            }
            None => Err(InconsistentError),
        })?;

        (self.map_link)(&self.pool[item.clone()])
            .set(&mut self.cell_key, Some(Link { prev, next }));

        if update_first {
            head.first = Some(item);
            self.set_head(head);
        }

        Ok(())
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) -> Result<(), InsertError> {
        self.insert(item, None)
    }

    /// Remove `item` from the list. Returns `item`.
    pub fn remove(&mut self, item: Index) -> Result<Index, ItemError> {
        let Some(link) = self.link_of(item.clone()) else {
            return Err(ItemError::NotLinked);
        };

        let mut head = self.head();
        if head.first.as_ref() == Some(&item) {
            if link.next == item {
                // The list just became empty
                head.first = None;
                self.set_head(head);

                (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);
                return Ok(item);
            }

            // Move the head pointer
            head.first = Some(link.next.clone());
            self.set_head(head);
        }

        // link.prev.next = link.next
        (self.map_link)(&self.pool[link.prev.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => {
                l.next = link.next.clone();
                Ok(())
            }
            None => Err(InconsistentError),
        })?;

        // link.next.prev = link.prev
        (self.map_link)(&self.pool[link.next.clone()]).modify(&mut self.cell_key, |l| match l {
            Some(l) => {
                l.prev = link.prev.clone();
                Ok(())
            }
            None => Err(InconsistentError),
        })?;

        (self.map_link)(&self.pool[item.clone()]).set(&mut self.cell_key, None);

        Ok(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Result<Option<Index>, InconsistentError> {
        self.front()?
            .map(|item| {
                // `ItemError::NotLinked` would be unexpected here, so convert
                // it to `InconsistentError`
                self.remove(item).map_err(|_| InconsistentError)
            })
            .transpose()
    }

    /// Get the next element of the specified element.
    #[inline]
    pub fn next(&self, i: Index) -> Result<Option<Index>, ItemError> {
        let next = self.link_of(i).ok_or(ItemError::NotLinked)?.next;
        Ok(if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        })
    }

    #[cfg(test)]
    pub fn iter(&self) -> Iter<'_, 'a, HeadCell, Pool, MapLink, CellKey, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of `ListAccessorCell`.
#[cfg(test)]
#[derive(Debug)]
pub struct Iter<'b, 'a, HeadCell, Pool, MapLink, CellKey, Index> {
    accessor: &'b ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>,
    next: Option<Index>,
}

#[cfg(test)]
impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<'b, 'a, HeadCell, Pool, MapLink, CellKey, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: 'a + Fn(&Element) -> &LinkCell,
    Element: 'a,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = Result<(Index, &'a Element), InconsistentError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = match self.accessor.next(next.clone()) {
            Ok(x) => x,
            Err(_) => return Some(Err(InconsistentError)),
        };
        Some(Ok((next.clone(), &self.accessor.pool[next])))
    }
}

//! 单向空闲链表
//!
//! 链表节点用 `usize` 句柄表示（空闲页链表中即页的物理地址），
//! 后继链接的存取交给 [`Chain`] 实现，链表本身只维护头部与长度。
//! 这样快慢指针对半拆分等算法与链接实际存放在哪里无关。

/// 节点后继链接的存储。
pub trait Chain {
    /// 读取 `node` 的后继。
    fn next(&self, node: usize) -> Option<usize>;

    /// 设置 `node` 的后继。
    fn set_next(&mut self, node: usize, next: Option<usize>);
}

/// 单向链表头部，记录首节点与节点数量。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeList {
    head: Option<usize>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// 将节点压入链表头部
    pub fn push<C: Chain>(&mut self, chain: &mut C, node: usize) {
        chain.set_next(node, self.head);
        self.head = Some(node);
        self.len += 1;
    }

    /// 从链表头部弹出节点，链表为空时返回 `None`
    pub fn pop<C: Chain>(&mut self, chain: &C) -> Option<usize> {
        let node = self.head?;
        self.head = chain.next(node);
        self.len -= 1;
        Some(node)
    }

    /// 用快慢指针把链表拆成两半，返回被拆走的后半部分。
    ///
    /// # 流程解释
    /// 慢指针从头节点出发每次前进一个节点，快指针从第二个节点出发每次前进两个节点；
    /// 快指针走到尽头时，慢指针停在前半部分的最后一个节点上，
    /// 从慢指针的后继开始的部分被摘下返回。
    ///
    /// 原链表保留 `ceil(n / 2)` 个节点，返回的链表有 `floor(n / 2)` 个节点。
    /// 只有一个节点时无法对半拆分，整条链表被拆走，原链表变为空。
    pub fn split_half<C: Chain>(&mut self, chain: &mut C) -> FreeList {
        let head = match self.head {
            Some(head) => head,
            None => return FreeList::new(),
        };
        if self.len == 1 {
            return core::mem::replace(self, FreeList::new());
        }

        let mut slow = head;
        let mut fast = chain.next(head);
        let mut kept = 1;
        while let Some(f) = fast {
            match chain.next(f) {
                Some(ff) => {
                    // slow 一定有后继：它落后于 fast
                    slow = match chain.next(slow) {
                        Some(s) => s,
                        None => break,
                    };
                    kept += 1;
                    fast = chain.next(ff);
                }
                None => break,
            }
        }

        let stolen = chain.next(slow);
        chain.set_next(slow, None);
        let taken = self.len - kept;
        self.len = kept;
        FreeList { head: stolen, len: taken }
    }

    /// 链表的尾节点
    pub fn tail<C: Chain>(&self, chain: &C) -> Option<usize> {
        let mut cur = self.head?;
        while let Some(next) = chain.next(cur) {
            cur = next;
        }
        Some(cur)
    }

    /// 已知 `other` 的尾节点为 `tail` 时，把 `other` 整条接到本链表之前。
    ///
    /// 尾节点由调用者事先用 [`FreeList::tail`] 求出，
    /// 这样遍历可以放在临界区之外，持锁期间只修改一个链接。
    pub fn splice<C: Chain>(&mut self, chain: &mut C, other: FreeList, tail: usize) {
        let head = match other.head {
            Some(head) => head,
            None => return,
        };
        chain.set_next(tail, self.head);
        self.head = Some(head);
        self.len += other.len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 基于下标的链接数组
    struct Arena(Vec<Option<usize>>);

    impl Chain for Arena {
        fn next(&self, node: usize) -> Option<usize> {
            self.0[node]
        }

        fn set_next(&mut self, node: usize, next: Option<usize>) {
            self.0[node] = next;
        }
    }

    fn build(n: usize) -> (Arena, FreeList) {
        let mut arena = Arena(vec![None; n]);
        let mut list = FreeList::new();
        for node in (0..n).rev() {
            list.push(&mut arena, node);
        }
        (arena, list)
    }

    fn collect(arena: &Arena, list: &FreeList) -> Vec<usize> {
        let mut nodes = Vec::new();
        let mut cur = list.head();
        while let Some(node) = cur {
            nodes.push(node);
            cur = arena.next(node);
        }
        nodes
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut arena = Arena(vec![None; 3]);
        let mut list = FreeList::new();
        list.push(&mut arena, 0);
        list.push(&mut arena, 2);
        assert_eq!(list.len(), 2);
        assert_eq!(list.pop(&arena), Some(2));
        assert_eq!(list.pop(&arena), Some(0));
        assert_eq!(list.pop(&arena), None);
        assert!(list.is_empty());
    }

    #[test]
    fn split_keeps_ceiling_half() {
        for n in 2..=17 {
            let (mut arena, mut list) = build(n);
            let stolen = list.split_half(&mut arena);
            let kept_nodes = collect(&arena, &list);
            let stolen_nodes = collect(&arena, &stolen);

            assert_eq!(kept_nodes.len(), (n + 1) / 2, "n = {}", n);
            assert_eq!(stolen_nodes.len(), n / 2, "n = {}", n);
            assert_eq!(list.len(), kept_nodes.len());
            assert_eq!(stolen.len(), stolen_nodes.len());

            let mut all: Vec<usize> = kept_nodes.iter().chain(stolen_nodes.iter()).copied().collect();
            all.sort_unstable();
            assert_eq!(all, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn split_of_ten_takes_the_back_five() {
        let (mut arena, mut list) = build(10);
        let stolen = list.split_half(&mut arena);
        assert_eq!(collect(&arena, &list), vec![0, 1, 2, 3, 4]);
        assert_eq!(collect(&arena, &stolen), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn split_single_and_empty() {
        let (mut arena, mut list) = build(1);
        let stolen = list.split_half(&mut arena);
        assert!(list.is_empty());
        assert_eq!(collect(&arena, &stolen), vec![0]);

        let mut empty = FreeList::new();
        assert!(empty.split_half(&mut arena).is_empty());
    }

    #[test]
    fn splice_keeps_existing_nodes() {
        let mut arena = Arena(vec![None; 6]);
        let mut local = FreeList::new();
        local.push(&mut arena, 5);
        let mut other = FreeList::new();
        for node in [2, 1, 0] {
            other.push(&mut arena, node);
        }
        let tail = other.tail(&arena).unwrap();
        assert_eq!(tail, 2);
        local.splice(&mut arena, other, tail);
        assert_eq!(local.len(), 4);
        assert_eq!(collect(&arena, &local), vec![0, 1, 2, 5]);

        assert_eq!(FreeList::new().tail(&arena), None);
        local.splice(&mut arena, FreeList::new(), 0);
        assert_eq!(local.len(), 4);
        assert_eq!(collect(&arena, &local), vec![0, 1, 2, 5]);
    }
}

//! Red-black tree ordered map, transactional mode.
//!
//! The whole of every operation — search, link, recolor, rotate — runs
//! inside one transaction, which is what makes an internal balanced tree
//! with parent pointers tractable: the rotations touch a handful of nodes
//! in arbitrary directions, and the engine's conflict detection replaces
//! any hand-made locking order. Under the default lazy policy, writes
//! buffer in the redo log and the rotated topology becomes visible
//! atomically at commit.
//!
//! Nodes store their child index (`id`) so rotations can navigate from a
//! node to its sibling without comparing keys. The sentinel's left child is
//! the root.

use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use orestm_engine::{
    AccessPolicy, Lazy, Orec, Ownable, OrecHandle, OrecPolicy, PerObject, Scalar, TField,
    ThreadCtx, TxResult, WoTxn, ro_run, wo_run,
};
use orestm_error::Result;
use orestm_types::MapConfig;

const LEFT: usize = 0;
const RIGHT: usize = 1;

const RED: u8 = 0;
const BLACK: u8 = 1;

struct Node<K: Scalar, V: Scalar, P: OrecPolicy> {
    orec: P::Handle,
    key: TField<K>,
    val: TField<V>,
    color: TField<u8>,
    parent: TField<*mut Node<K, V, P>>,
    /// Which child of the parent this node is (LEFT or RIGHT).
    id: TField<u8>,
    children: [TField<*mut Node<K, V, P>>; 2],
}

impl<K: Scalar, V: Scalar, P: OrecPolicy> Ownable for Node<K, V, P> {
    fn orec(&self) -> &Orec {
        self.orec.orec()
    }
}

/// An ordered map over an internal red-black tree.
pub struct RbtreeOmap<K: Scalar, V: Scalar, P: OrecPolicy = PerObject, A: AccessPolicy = Lazy> {
    sentinel: *mut Node<K, V, P>,
    _policy: PhantomData<A>,
}

// SAFETY: all shared node state goes through engine fields and orecs.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy, A: AccessPolicy> Send
    for RbtreeOmap<K, V, P, A>
{
}
// SAFETY: as above.
unsafe impl<K: Scalar + Send + Sync, V: Scalar + Send + Sync, P: OrecPolicy, A: AccessPolicy> Sync
    for RbtreeOmap<K, V, P, A>
{
}

impl<K, V, P, A> RbtreeOmap<K, V, P, A>
where
    K: Scalar + Ord,
    V: Scalar,
    P: OrecPolicy,
    A: AccessPolicy,
{
    /// Construct an empty tree (just the black sentinel).
    ///
    /// # Errors
    ///
    /// Fails if `cfg` does not validate.
    pub fn new(me: &mut ThreadCtx, cfg: &MapConfig) -> Result<Self> {
        cfg.validate()?;
        let _ = me;
        let sentinel = Box::into_raw(Self::make_node(
            BLACK,
            K::from_bits(0),
            V::from_bits(0),
            ptr::null_mut(),
            0,
        ));
        Ok(Self {
            sentinel,
            _policy: PhantomData,
        })
    }

    fn make_node(
        color: u8,
        key: K,
        val: V,
        parent: *mut Node<K, V, P>,
        id: u8,
    ) -> Box<Node<K, V, P>> {
        let mut node = Box::new(Node {
            orec: P::placeholder(),
            key: TField::new(key),
            val: TField::new(val),
            color: TField::new(color),
            parent: TField::new(parent),
            id: TField::new(id),
            children: [TField::new(ptr::null_mut()), TField::new(ptr::null_mut())],
        });
        node.orec = P::attach(ptr::addr_of!(*node) as usize);
        node
    }

    /// Look up `key`.
    pub fn get(&self, me: &mut ThreadCtx, key: K) -> Option<V> {
        me.op_begin();
        let result = ro_run::<A, _, _>(me, |tx| {
            // SAFETY: the sentinel lives as long as the map; all other
            // nodes reached below stay allocated under SMR.
            let s_ref = unsafe { &*self.sentinel };
            let mut curr = s_ref.children[LEFT].get(tx, s_ref)?;
            while !curr.is_null() {
                // SAFETY: as above.
                let c_ref = unsafe { &*curr };
                let ckey = c_ref.key.get(tx, c_ref)?;
                if ckey == key {
                    return Ok(Some(c_ref.val.get(tx, c_ref)?));
                }
                curr = c_ref.children[usize::from(key >= ckey)].get(tx, c_ref)?;
            }
            Ok(None)
        });
        me.op_end();
        result
    }

    /// Insert `key -> val` if absent. Returns `false` when the key exists.
    pub fn insert(&self, me: &mut ThreadCtx, key: K, val: V) -> bool {
        me.op_begin();
        let result = wo_run::<A, _, _>(me, |tx| self.insert_tx(tx, key, val));
        me.op_end();
        result
    }

    #[allow(clippy::too_many_lines)]
    fn insert_tx(&self, tx: &mut WoTxn<'_, A>, key: K, val: V) -> TxResult<bool> {
        // Find the insertion point.
        // SAFETY: as in `get`.
        let mut curr = self.sentinel;
        let mut c_id = LEFT;
        let mut child = unsafe { &*curr }.children[c_id].get(tx, unsafe { &*curr })?;
        while !child.is_null() {
            // SAFETY: as in `get`.
            let ch_ref = unsafe { &*child };
            let ckey = ch_ref.key.get(tx, ch_ref)?;
            if ckey == key {
                return Ok(false);
            }
            c_id = usize::from(key >= ckey);
            curr = child;
            child = ch_ref.children[c_id].get(tx, ch_ref)?;
        }

        // Make a red node and connect it to `curr`.
        let new_node = tx
            .log_new(Self::make_node(RED, key, val, curr, c_id as u8))
            .as_ptr();
        // SAFETY: as in `get`.
        let curr_ref = unsafe { &*curr };
        curr_ref.children[c_id].set(tx, curr_ref, new_node)?;

        // Balance the tree.
        let mut child = new_node;
        loop {
            // SAFETY: every pointer below was read transactionally from a
            // validated node this execution.
            let ch_ref = unsafe { &*child };
            let parent = ch_ref.parent.get(tx, ch_ref)?;
            let p_ref = unsafe { &*parent };
            let p_id = p_ref.id.get(tx, p_ref)? as usize;
            let gparent = p_ref.parent.get(tx, p_ref)?;

            // No more propagation needed.
            if gparent == self.sentinel || p_ref.color.get(tx, p_ref)? == BLACK {
                break;
            }
            let g_ref = unsafe { &*gparent };

            // If the parent's sibling is also red, push red up.
            let psib = g_ref.children[1 - p_id].get(tx, g_ref)?;
            if !psib.is_null() {
                let ps_ref = unsafe { &*psib };
                if ps_ref.color.get(tx, ps_ref)? == RED {
                    p_ref.color.set(tx, p_ref, BLACK)?;
                    ps_ref.color.set(tx, ps_ref, BLACK)?;
                    g_ref.color.set(tx, g_ref, RED)?;
                    child = gparent;
                    continue;
                }
            }

            let parent = {
                let c_id = ch_ref.id.get(tx, ch_ref)? as usize;
                if c_id == p_id {
                    parent
                } else {
                    // Inner child: rotate it up into the parent's place,
                    // then treat it as the parent for the outer rotation.
                    let baby = ch_ref.children[1 - c_id].get(tx, ch_ref)?;
                    p_ref.children[c_id].set(tx, p_ref, baby)?;
                    if !baby.is_null() {
                        // SAFETY: as above.
                        let b_ref = unsafe { &*baby };
                        b_ref.parent.set(tx, b_ref, parent)?;
                        b_ref.id.set(tx, b_ref, c_id as u8)?;
                    }
                    ch_ref.children[1 - c_id].set(tx, ch_ref, parent)?;
                    p_ref.parent.set(tx, p_ref, child)?;
                    p_ref.id.set(tx, p_ref, (1 - c_id) as u8)?;
                    g_ref.children[p_id].set(tx, g_ref, child)?;
                    ch_ref.parent.set(tx, ch_ref, gparent)?;
                    ch_ref.id.set(tx, ch_ref, p_id as u8)?;
                    child
                }
            };
            // SAFETY: as above.
            let p_ref = unsafe { &*parent };

            p_ref.color.set(tx, p_ref, BLACK)?;
            g_ref.color.set(tx, g_ref, RED)?;
            // Promote the parent over the grandparent.
            let ggparent = g_ref.parent.get(tx, g_ref)?;
            let gg_ref = unsafe { &*ggparent };
            let g_id = g_ref.id.get(tx, g_ref)? as usize;
            let ochild = p_ref.children[1 - p_id].get(tx, p_ref)?;
            g_ref.children[p_id].set(tx, g_ref, ochild)?;
            if !ochild.is_null() {
                let o_ref = unsafe { &*ochild };
                o_ref.parent.set(tx, o_ref, gparent)?;
                o_ref.id.set(tx, o_ref, p_id as u8)?;
            }
            p_ref.children[1 - p_id].set(tx, p_ref, gparent)?;
            g_ref.parent.set(tx, g_ref, parent)?;
            g_ref.id.set(tx, g_ref, (1 - p_id) as u8)?;
            gg_ref.children[g_id].set(tx, gg_ref, parent)?;
            p_ref.parent.set(tx, p_ref, ggparent)?;
            p_ref.id.set(tx, p_ref, g_id as u8)?;
            break;
        }

        // The root is always black.
        // SAFETY: as in `get`.
        let s_ref = unsafe { &*self.sentinel };
        let root = s_ref.children[LEFT].get(tx, s_ref)?;
        let r_ref = unsafe { &*root };
        if r_ref.color.get(tx, r_ref)? != BLACK {
            r_ref.color.set(tx, r_ref, BLACK)?;
        }
        Ok(true)
    }

    /// Remove `key`. Returns `false` when the key is absent.
    pub fn remove(&self, me: &mut ThreadCtx, key: K) -> bool {
        me.op_begin();
        let result = wo_run::<A, _, _>(me, |tx| self.remove_tx(tx, key));
        me.op_end();
        result
    }

    #[allow(clippy::too_many_lines)]
    fn remove_tx(&self, tx: &mut WoTxn<'_, A>, key: K) -> TxResult<bool> {
        // Find the key.
        // SAFETY: as in `get`.
        let s_ref = unsafe { &*self.sentinel };
        let mut curr = s_ref.children[LEFT].get(tx, s_ref)?;
        while !curr.is_null() {
            // SAFETY: as in `get`.
            let c_ref = unsafe { &*curr };
            let ckey = c_ref.key.get(tx, c_ref)?;
            if ckey == key {
                break;
            }
            curr = c_ref.children[usize::from(key >= ckey)].get(tx, c_ref)?;
        }
        if curr.is_null() {
            return Ok(false);
        }

        // Two children: swap in the successor's pair, then delete the
        // successor instead.
        // SAFETY: as in `get`.
        let c_ref = unsafe { &*curr };
        if !c_ref.children[RIGHT].get(tx, c_ref)?.is_null()
            && !c_ref.children[LEFT].get(tx, c_ref)?.is_null()
        {
            let mut leftmost = c_ref.children[RIGHT].get(tx, c_ref)?;
            loop {
                // SAFETY: as in `get`.
                let l_ref = unsafe { &*leftmost };
                let next = l_ref.children[LEFT].get(tx, l_ref)?;
                if next.is_null() {
                    break;
                }
                leftmost = next;
            }
            // SAFETY: as in `get`.
            let l_ref = unsafe { &*leftmost };
            let l_key = l_ref.key.get(tx, l_ref)?;
            c_ref.key.set(tx, c_ref, l_key)?;
            let l_val = l_ref.val.get(tx, l_ref)?;
            c_ref.val.set(tx, c_ref, l_val)?;
            curr = leftmost;
        }

        // Extract `curr` from the tree.
        // SAFETY: as in `get`.
        let c_ref = unsafe { &*curr };
        let parent = c_ref.parent.get(tx, c_ref)?;
        let p_ref = unsafe { &*parent };
        let left = c_ref.children[LEFT].get(tx, c_ref)?;
        let child = if !left.is_null() {
            left
        } else {
            c_ref.children[RIGHT].get(tx, c_ref)?
        };
        let x_id = c_ref.id.get(tx, c_ref)? as usize;
        p_ref.children[x_id].set(tx, p_ref, child)?;
        if !child.is_null() {
            // SAFETY: as in `get`.
            let ch_ref = unsafe { &*child };
            ch_ref.parent.set(tx, ch_ref, parent)?;
            ch_ref.id.set(tx, ch_ref, x_id as u8)?;
        }

        // Fix an easy black-height violation in place.
        if c_ref.color.get(tx, c_ref)? == BLACK && !child.is_null() {
            // SAFETY: as in `get`.
            let ch_ref = unsafe { &*child };
            if ch_ref.color.get(tx, ch_ref)? == RED {
                c_ref.color.set(tx, c_ref, RED)?;
                ch_ref.color.set(tx, ch_ref, BLACK)?;
            }
        }

        // Rebalance upward. Save the deletion target first.
        let to_delete = curr;
        loop {
            // SAFETY: every node here was reached transactionally.
            let c_ref = unsafe { &*curr };
            let parent = c_ref.parent.get(tx, c_ref)?;
            if parent == self.sentinel || c_ref.color.get(tx, c_ref)? == RED {
                break;
            }
            let p_ref = unsafe { &*parent };
            let c_id = c_ref.id.get(tx, c_ref)? as usize;
            let mut sibling = p_ref.children[1 - c_id].get(tx, p_ref)?;
            let mut s_ref = unsafe { &*sibling };

            // We want the sibling to be black; if not, promote and recolor.
            if s_ref.color.get(tx, s_ref)? == RED {
                p_ref.color.set(tx, p_ref, RED)?;
                s_ref.color.set(tx, s_ref, BLACK)?;
                let gparent = p_ref.parent.get(tx, p_ref)?;
                let g_ref = unsafe { &*gparent };
                let p_id = p_ref.id.get(tx, p_ref)? as usize;
                let nephew = s_ref.children[c_id].get(tx, s_ref)?;
                let n_ref = unsafe { &*nephew };
                p_ref.children[1 - c_id].set(tx, p_ref, nephew)?;
                n_ref.parent.set(tx, n_ref, parent)?;
                n_ref.id.set(tx, n_ref, (1 - c_id) as u8)?;
                s_ref.children[c_id].set(tx, s_ref, parent)?;
                p_ref.parent.set(tx, p_ref, sibling)?;
                p_ref.id.set(tx, p_ref, c_id as u8)?;
                g_ref.children[p_id].set(tx, g_ref, sibling)?;
                s_ref.parent.set(tx, s_ref, gparent)?;
                s_ref.id.set(tx, s_ref, p_id as u8)?;
                sibling = nephew;
                s_ref = unsafe { &*sibling };
            }

            // Far nephew red: one rotation finishes it.
            let far = s_ref.children[1 - c_id].get(tx, s_ref)?;
            if !far.is_null() {
                // SAFETY: as above.
                let f_ref = unsafe { &*far };
                if f_ref.color.get(tx, f_ref)? == RED {
                    let p_color = p_ref.color.get(tx, p_ref)?;
                    s_ref.color.set(tx, s_ref, p_color)?;
                    p_ref.color.set(tx, p_ref, BLACK)?;
                    f_ref.color.set(tx, f_ref, BLACK)?;
                    let gparent = p_ref.parent.get(tx, p_ref)?;
                    let g_ref = unsafe { &*gparent };
                    let p_id = p_ref.id.get(tx, p_ref)? as usize;
                    let nephew = s_ref.children[c_id].get(tx, s_ref)?;
                    p_ref.children[1 - c_id].set(tx, p_ref, nephew)?;
                    if !nephew.is_null() {
                        let n_ref = unsafe { &*nephew };
                        n_ref.parent.set(tx, n_ref, parent)?;
                        n_ref.id.set(tx, n_ref, (1 - c_id) as u8)?;
                    }
                    s_ref.children[c_id].set(tx, s_ref, parent)?;
                    p_ref.parent.set(tx, p_ref, sibling)?;
                    p_ref.id.set(tx, p_ref, c_id as u8)?;
                    g_ref.children[p_id].set(tx, g_ref, sibling)?;
                    s_ref.parent.set(tx, s_ref, gparent)?;
                    s_ref.id.set(tx, s_ref, p_id as u8)?;
                    break;
                }
            }

            // Near nephew red: rotate it over the sibling, which leaves the
            // old sibling as a red far nephew, then finish as above.
            let near = s_ref.children[c_id].get(tx, s_ref)?;
            if !near.is_null() {
                // SAFETY: as above.
                let near_ref = unsafe { &*near };
                if near_ref.color.get(tx, near_ref)? == RED {
                    s_ref.color.set(tx, s_ref, RED)?;
                    near_ref.color.set(tx, near_ref, BLACK)?;
                    // Promote `near` over the sibling.
                    let gneph = near_ref.children[1 - c_id].get(tx, near_ref)?;
                    s_ref.children[c_id].set(tx, s_ref, gneph)?;
                    if !gneph.is_null() {
                        let gn_ref = unsafe { &*gneph };
                        gn_ref.parent.set(tx, gn_ref, sibling)?;
                        gn_ref.id.set(tx, gn_ref, c_id as u8)?;
                    }
                    near_ref.children[1 - c_id].set(tx, near_ref, sibling)?;
                    s_ref.parent.set(tx, s_ref, near)?;
                    s_ref.id.set(tx, s_ref, (1 - c_id) as u8)?;
                    p_ref.children[1 - c_id].set(tx, p_ref, near)?;
                    near_ref.parent.set(tx, near_ref, parent)?;
                    near_ref.id.set(tx, near_ref, (1 - c_id) as u8)?;

                    // Roles swap: `near` is the sibling now, and the old
                    // sibling is its red far nephew.
                    let new_sibling = near;
                    let ns_ref = near_ref;
                    let far_ref = s_ref;

                    let p_color = p_ref.color.get(tx, p_ref)?;
                    ns_ref.color.set(tx, ns_ref, p_color)?;
                    p_ref.color.set(tx, p_ref, BLACK)?;
                    far_ref.color.set(tx, far_ref, BLACK)?;
                    let gparent = p_ref.parent.get(tx, p_ref)?;
                    let g_ref = unsafe { &*gparent };
                    let p_id = p_ref.id.get(tx, p_ref)? as usize;
                    let nephew = ns_ref.children[c_id].get(tx, ns_ref)?;
                    p_ref.children[1 - c_id].set(tx, p_ref, nephew)?;
                    if !nephew.is_null() {
                        let n2_ref = unsafe { &*nephew };
                        n2_ref.parent.set(tx, n2_ref, parent)?;
                        n2_ref.id.set(tx, n2_ref, (1 - c_id) as u8)?;
                    }
                    ns_ref.children[c_id].set(tx, ns_ref, parent)?;
                    p_ref.parent.set(tx, p_ref, new_sibling)?;
                    p_ref.id.set(tx, p_ref, c_id as u8)?;
                    g_ref.children[p_id].set(tx, g_ref, new_sibling)?;
                    ns_ref.parent.set(tx, ns_ref, gparent)?;
                    ns_ref.id.set(tx, ns_ref, p_id as u8)?;
                    break;
                }
            }

            // Both nephews black: repaint and propagate upward.
            s_ref.color.set(tx, s_ref, RED)?;
            curr = parent;
        }

        // If `curr` ended red (or is the root), this restores the invariant.
        // SAFETY: as in `get`.
        let c_ref = unsafe { &*curr };
        c_ref.color.set(tx, c_ref, BLACK)?;

        // SAFETY: unlinked above; unreachable once this commits.
        unsafe { tx.reclaim(NonNull::new_unchecked(to_delete)) };
        Ok(true)
    }
}

impl<K: Scalar, V: Scalar, P: OrecPolicy, A: AccessPolicy> Drop for RbtreeOmap<K, V, P, A> {
    fn drop(&mut self) {
        // SAFETY: exclusive access during drop.
        let mut sentinel = unsafe { Box::from_raw(self.sentinel) };
        drop_subtree::<K, V, P>(sentinel.children[LEFT].get_mut());
    }
}

fn drop_subtree<K: Scalar, V: Scalar, P: OrecPolicy>(node: *mut Node<K, V, P>) {
    if node.is_null() {
        return;
    }
    // SAFETY: exclusive access during drop; every node is Box-allocated.
    let mut boxed = unsafe { Box::from_raw(node) };
    let left = boxed.children[LEFT].get_mut();
    let right = boxed.children[RIGHT].get_mut();
    drop(boxed);
    drop_subtree::<K, V, P>(left);
    drop_subtree::<K, V, P>(right);
}

//! Scene identity and the per-stage binding to at most one scene.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCENE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a scene, used to tell bindings apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SceneId(u64);

impl SceneId {
    pub fn next() -> Self {
        SceneId(NEXT_SCENE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Resources a stage creates for one scene and destroys when unbinding it.
pub trait SceneResources<C> {
    fn destroy(self, ctx: &mut C);
}

/// Holds the scene-scoped resources of one stage.
///
/// `register` always releases the current binding before creating the new
/// one, so a stage never holds resources of two scenes at once.
pub struct SceneSlot<R> {
    bound: Option<(SceneId, R)>,
}

impl<R> Default for SceneSlot<R> {
    fn default() -> Self {
        Self { bound: None }
    }
}

impl<R> SceneSlot<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scene_id(&self) -> Option<SceneId> {
        self.bound.as_ref().map(|(id, _)| *id)
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    pub fn get(&self) -> Option<&R> {
        self.bound.as_ref().map(|(_, resources)| resources)
    }

    pub fn get_mut(&mut self) -> Option<&mut R> {
        self.bound.as_mut().map(|(_, resources)| resources)
    }

    /// Release the current binding (if any), then bind the result of `create`.
    /// On failure the slot is left unbound.
    pub fn register<C>(
        &mut self,
        ctx: &mut C,
        id: SceneId,
        create: impl FnOnce(&mut C) -> Result<R, String>,
    ) -> Result<(), String>
    where
        R: SceneResources<C>,
    {
        self.release(ctx);
        let resources = create(ctx)?;
        self.bound = Some((id, resources));
        Ok(())
    }

    /// Destroy the bound resources. Returns whether anything was bound.
    pub fn release<C>(&mut self, ctx: &mut C) -> bool
    where
        R: SceneResources<C>,
    {
        match self.bound.take() {
            Some((_, resources)) => {
                resources.destroy(ctx);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counters {
        created: usize,
        destroyed: Vec<u32>,
    }

    struct Resources(u32);

    impl SceneResources<Counters> for Resources {
        fn destroy(self, ctx: &mut Counters) {
            ctx.destroyed.push(self.0);
        }
    }

    fn create(tag: u32) -> impl FnOnce(&mut Counters) -> Result<Resources, String> {
        move |ctx: &mut Counters| {
            ctx.created += 1;
            Ok(Resources(tag))
        }
    }

    #[test]
    fn second_registration_releases_first() {
        let mut ctx = Counters::default();
        let mut slot = SceneSlot::new();
        let (s1, s2) = (SceneId::next(), SceneId::next());

        slot.register(&mut ctx, s1, create(1)).unwrap();
        slot.register(&mut ctx, s2, create(2)).unwrap();

        assert_eq!(slot.scene_id(), Some(s2));
        assert_eq!(slot.get().map(|r| r.0), Some(2));
        assert_eq!(ctx.created, 2);
        assert_eq!(ctx.destroyed, vec![1]);
    }

    #[test]
    fn release_is_idempotent() {
        let mut ctx = Counters::default();
        let mut slot = SceneSlot::new();
        slot.register(&mut ctx, SceneId::next(), create(7)).unwrap();

        assert!(slot.release(&mut ctx));
        assert!(!slot.release(&mut ctx));
        assert!(!slot.is_bound());
        assert_eq!(ctx.destroyed, vec![7]);
    }

    #[test]
    fn failed_registration_leaves_slot_unbound() {
        let mut ctx = Counters::default();
        let mut slot = SceneSlot::new();
        slot.register(&mut ctx, SceneId::next(), create(1)).unwrap();

        let result = slot.register(&mut ctx, SceneId::next(), |_: &mut Counters| {
            Err::<Resources, _>("out of memory".to_string())
        });

        assert!(result.is_err());
        assert!(!slot.is_bound());
        assert_eq!(ctx.destroyed, vec![1]);
    }

    #[test]
    fn bound_resources_can_be_rebuilt_in_place() {
        let mut ctx = Counters::default();
        let mut slot = SceneSlot::new();
        assert!(slot.get_mut().is_none());

        slot.register(&mut ctx, SceneId::next(), create(3)).unwrap();
        if let Some(resources) = slot.get_mut() {
            resources.0 = 4;
        }
        slot.release(&mut ctx);
        assert_eq!(ctx.destroyed, vec![4]);
    }

    #[test]
    fn scene_ids_are_unique() {
        assert_ne!(SceneId::next(), SceneId::next());
    }
}

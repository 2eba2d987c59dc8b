use object::Value;

/// Consumers implement this to provide GC roots.
///
/// Called once while marking and once while fixing references. The visitor
/// receives `&mut Value` so the collector can update root pointers in place
/// before objects move. Non-reference values are ignored.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for root in self.iter_mut() {
            visitor(root);
        }
    }
}

impl RootProvider for [Value] {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for root in self.iter_mut() {
            visitor(root);
        }
    }
}

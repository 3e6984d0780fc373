use crate::gcref::HeaderRef;

/// Receives the references found while tracing roots, constraints and PMC bodies.
pub trait Visitor {
    fn mark_header(&mut self, header: HeaderRef);

    fn mark_optional(&mut self, header: Option<HeaderRef>) {
        if let Some(header) = header {
            self.mark_header(header);
        }
    }
}

impl<F: FnMut(HeaderRef)> Visitor for F {
    fn mark_header(&mut self, header: HeaderRef) {
        self(header)
    }
}

use crate::types::{ScenarioChain, VisualizationData, VizEdge, VizNode};

/// Lay a chain out as a two-level tree: the chain's initial shock at the
/// root, one child per follow-on event in insertion order.
///
/// Root magnitude is the net initial impact; a child's magnitude is the root
/// magnitude scaled by the event's modifier.
pub fn build_visualization(chain: &ScenarioChain) -> VisualizationData {
    let root_magnitude: f64 = chain.initial_impact.values().sum();
    let root_id = chain.name.clone();

    let mut nodes = Vec::with_capacity(chain.leads_to.len() + 1);
    let mut edges = Vec::with_capacity(chain.leads_to.len());

    nodes.push(VizNode {
        id: root_id.clone(),
        label: chain.name.clone(),
        level: 0,
        column: 0,
        at_period: 0,
        probability: 1.0,
        magnitude: root_magnitude,
    });

    for (i, event) in chain.leads_to.iter().enumerate() {
        // Index keeps ids unique when the same scenario appears twice.
        let id = format!("{}/{}:{}", chain.name, i, event.scenario);
        nodes.push(VizNode {
            id: id.clone(),
            label: event.scenario.clone(),
            level: 1,
            column: i as u32,
            at_period: event.delay,
            probability: event.probability,
            magnitude: root_magnitude * event.magnitude_modifier,
        });
        edges.push(VizEdge {
            from: root_id.clone(),
            to: id,
            probability: event.probability,
            delay: event.delay,
        });
    }

    VisualizationData { chain: chain.name.clone(), nodes, edges }
}

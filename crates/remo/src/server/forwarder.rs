//! Relays one local event source to one remote peer.

use std::sync::Arc;
use std::sync::Weak;

use remowire::Body;
use remowire::Message;
use remowire::Value;
use tracing::trace;

use crate::access::Operation;
use crate::access::Permissions;
use crate::access::permitted;
use crate::caller::RemoteCaller;
use crate::object::Component;
use crate::object::EventSink;
use crate::object::ExposedObject;
use crate::object::SubscriptionId;
use crate::outbox::Outbox;
use crate::server::session::MessageIds;

/// Everything a forwarder needs to re-check delivery on each emission.
pub(crate) struct Route {
    pub component: Arc<dyn Component>,
    pub name: String,
    pub object: Weak<dyn ExposedObject>,
    pub permissions: Permissions,
    pub caller: RemoteCaller,
    pub object_id: i32,
    pub event: String,
}

pub(crate) struct EventForwarder {
    object: Weak<dyn ExposedObject>,
    subscription: SubscriptionId,
}

impl EventForwarder {
    /// Subscribes to the event on the live object. `None` if the object refuses.
    pub fn attach(
        object: &Arc<dyn ExposedObject>,
        route: Route,
        outbox: Outbox,
        ids: MessageIds,
    ) -> Option<Self> {
        let event = route.event.clone();
        let sink: EventSink = Arc::new(move |args: &[Value]| deliver(&route, &outbox, &ids, args));
        let subscription = object.subscribe(&event, sink)?;
        Some(Self { object: Arc::downgrade(object), subscription })
    }

    /// Stops the relay. A dead object has nothing left to unsubscribe from.
    pub fn detach(self) {
        if let Some(object) = self.object.upgrade() {
            object.unsubscribe(self.subscription);
        }
    }
}

fn deliver(route: &Route, outbox: &Outbox, ids: &MessageIds, args: &[Value]) {
    let Some(object) = route.object.upgrade() else {
        return;
    };
    let op = Operation::DeliverEvent(&route.event);
    if !permitted(route.component.as_ref(), &route.name, object.as_ref(), &route.permissions, &op, &route.caller) {
        trace!(session = %route.caller.session, event = %route.event, "delivery denied");
        return;
    }
    let msg = Message::new(ids.next(), Body::EventDelivery {
        object_id: route.object_id,
        event: route.event.clone(),
        args: args.to_vec(),
    });
    let _ = outbox.send(&msg);
}
